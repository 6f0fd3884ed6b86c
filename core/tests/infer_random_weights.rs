use anyhow::{Context, Result};
use approx::assert_abs_diff_eq;
use candle_core::Device as CandleDevice;
use ndarray::Array5;
use std::path::{Path, PathBuf};
use timesformer_rs::clip::{synthetic_clip, ClipShape};
use timesformer_rs::inference::init_random_weights;
use timesformer_rs::{AttentionType, Device, ModelConfig, TimesformerError, TimesformerModel};

/// Kinetics-600 divided space-time geometry with a narrow backbone.
fn k600_config() -> ModelConfig {
    ModelConfig {
        img_size: 224,
        num_classes: 600,
        num_frames: 8,
        attention_type: AttentionType::DividedSpaceTime,
        embed_dim: 16,
        depth: 1,
        num_heads: 2,
        ..ModelConfig::default()
    }
}

fn small_config(attention_type: AttentionType) -> ModelConfig {
    ModelConfig {
        img_size: 32,
        patch_size: 16,
        num_classes: 10,
        num_frames: 4,
        attention_type,
        embed_dim: 16,
        depth: 2,
        num_heads: 4,
        ..ModelConfig::default()
    }
}

fn with_random_weights(mut config: ModelConfig, dir: &Path, name: &str) -> Result<ModelConfig> {
    let path = dir.join(name);
    init_random_weights(&config, &path).context("Failed to write random weights")?;
    config.weights_path = Some(path);
    Ok(config)
}

#[test]
fn infer_k600_output_shape() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(k600_config(), dir.path(), "k600.safetensors")?;
    let model = TimesformerModel::load(&config, Device::cpu()).context("Failed to load model")?;

    let clips = synthetic_clip(ClipShape::for_config(2, &config), Some(0));
    assert_eq!(clips.shape(), &[2, 3, 8, 224, 224]);

    let result = model.infer(&clips)?;
    assert_eq!(result.shape(), &[2, 600]);
    assert!(result.predictions.iter().all(|v| v.is_finite()));

    Ok(())
}

#[test]
fn infer_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        small_config(AttentionType::DividedSpaceTime),
        dir.path(),
        "divided.safetensors",
    )?;
    let model = TimesformerModel::load(&config, Device::cpu())?;

    let clips = synthetic_clip(ClipShape::for_config(3, &config), Some(11));
    let first = model.infer(&clips)?;
    let second = model.infer(&clips)?;
    assert_eq!(first.predictions, second.predictions);

    Ok(())
}

#[test]
fn infer_different_batches_same_shape() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        small_config(AttentionType::JointSpaceTime),
        dir.path(),
        "joint.safetensors",
    )?;
    let model = TimesformerModel::load(&config, Device::cpu())?;
    let shape = ClipShape::for_config(2, &config);

    let a = model.infer(&synthetic_clip(shape, None))?;
    let b = model.infer(&synthetic_clip(shape, None))?;
    assert_eq!(a.shape(), &[2, 10]);
    assert_eq!(b.shape(), &[2, 10]);

    Ok(())
}

#[test]
fn infer_batch_dimension_follows_input() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for attention_type in [
        AttentionType::DividedSpaceTime,
        AttentionType::JointSpaceTime,
        AttentionType::SpaceOnly,
    ] {
        let config = with_random_weights(
            small_config(attention_type),
            dir.path(),
            &format!("{}.safetensors", attention_type),
        )?;
        let model = TimesformerModel::load(&config, Device::cpu())?;
        for batch in [1, 4] {
            let clips = synthetic_clip(ClipShape::for_config(batch, &config), Some(batch as u64));
            let result = model.infer(&clips)?;
            assert_eq!(result.shape(), &[batch, 10], "{}", attention_type);
        }
    }
    Ok(())
}

#[test]
fn clips_are_scored_independently() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        small_config(AttentionType::DividedSpaceTime),
        dir.path(),
        "divided.safetensors",
    )?;
    let model = TimesformerModel::load(&config, Device::cpu())?;

    let clips = synthetic_clip(ClipShape::for_config(2, &config), Some(5));
    let batched = model.infer(&clips)?;
    for i in 0..2 {
        let single = clips.slice(ndarray::s![i..i + 1, .., .., .., ..]).to_owned();
        let alone = model.infer(&single)?;
        for (a, b) in alone.predictions.row(0).iter().zip(batched.predictions.row(i)) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }
    Ok(())
}

#[test]
fn load_missing_weights_is_not_found() {
    let config = ModelConfig {
        weights_path: Some(PathBuf::from("/nonexistent/TimeSformer_divST_8x32_224_K600.pyth")),
        ..k600_config()
    };
    let err = TimesformerModel::load(&config, Device::cpu()).err().unwrap();
    assert!(matches!(err, TimesformerError::FileNotFound(_)), "{}", err);
}

#[test]
fn load_wrong_width_is_mismatch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        small_config(AttentionType::DividedSpaceTime),
        dir.path(),
        "divided.safetensors",
    )?;

    let wider = ModelConfig {
        embed_dim: 32,
        ..config.clone()
    };
    let err = TimesformerModel::load(&wider, Device::cpu()).err().unwrap();
    assert!(matches!(err, TimesformerError::WeightsMismatch(_)), "{}", err);

    let more_classes = ModelConfig {
        num_classes: 11,
        ..config
    };
    let err = TimesformerModel::load(&more_classes, Device::cpu()).err().unwrap();
    assert!(matches!(err, TimesformerError::WeightsMismatch(_)), "{}", err);

    Ok(())
}

#[test]
fn load_missing_temporal_parameters_is_mismatch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let joint = with_random_weights(
        small_config(AttentionType::JointSpaceTime),
        dir.path(),
        "joint.safetensors",
    )?;

    let divided = ModelConfig {
        attention_type: AttentionType::DividedSpaceTime,
        ..joint
    };
    let err = TimesformerModel::load(&divided, Device::cpu()).err().unwrap();
    assert!(matches!(err, TimesformerError::WeightsMismatch(_)), "{}", err);

    Ok(())
}

#[test]
fn load_flattened_patch_projection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        small_config(AttentionType::DividedSpaceTime),
        dir.path(),
        "conv.safetensors",
    )?;
    let conv_path = config.weights_path.clone().context("weights path")?;

    // Rewrite the patch projection as a (embed, channels * patch * patch) matrix.
    let mut tensors = candle_core::safetensors::load(&conv_path, &CandleDevice::Cpu)?;
    let name = "model.patch_embed.proj.weight";
    let weight = tensors.remove(name).context("missing patch projection")?;
    tensors.insert(name.to_string(), weight.reshape((16, 3 * 16 * 16))?);
    let linear_path = dir.path().join("linear.safetensors");
    candle_core::safetensors::save(&tensors, &linear_path)?;

    let linear = ModelConfig {
        weights_path: Some(linear_path),
        ..config.clone()
    };
    let conv_model = TimesformerModel::load(&config, Device::cpu())?;
    let linear_model = TimesformerModel::load(&linear, Device::cpu())?;

    let clips = synthetic_clip(ClipShape::for_config(1, &config), Some(3));
    let a = conv_model.infer(&clips)?;
    let b = linear_model.infer(&clips)?;
    for (x, y) in a.predictions.iter().zip(b.predictions.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn load_unprefixed_weights() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        ModelConfig {
            weights_prefix: String::new(),
            ..small_config(AttentionType::SpaceOnly)
        },
        dir.path(),
        "bare.safetensors",
    )?;
    let model = TimesformerModel::load(&config, Device::cpu())?;
    let result = model.infer(&Array5::<f32>::zeros((1, 3, 4, 32, 32)))?;
    assert_eq!(result.shape(), &[1, 10]);

    // The same artifact read with the default prefix has no parameters.
    let prefixed = ModelConfig {
        weights_prefix: "model".to_string(),
        ..config
    };
    let err = TimesformerModel::load(&prefixed, Device::cpu()).err().unwrap();
    assert!(matches!(err, TimesformerError::WeightsMismatch(_)), "{}", err);
    Ok(())
}

#[test]
fn resize_scores_longer_clips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = with_random_weights(
        small_config(AttentionType::DividedSpaceTime),
        dir.path(),
        "divided.safetensors",
    )?;

    let strict = TimesformerModel::load(&config, Device::cpu())?;
    let clips = synthetic_clip(
        ClipShape {
            batch: 2,
            channels: 3,
            frames: 8,
            height: 48,
            width: 48,
        },
        Some(8),
    );
    let err = strict.infer(&clips).unwrap_err();
    assert!(matches!(err, TimesformerError::ShapeMismatch(_)), "{}", err);

    let resizing = TimesformerModel::load(&config, Device::cpu())?.with_resize(true);
    let result = resizing.infer(&clips)?;
    assert_eq!(result.shape(), &[2, 10]);

    Ok(())
}
