//! Weight artifact handling.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tracing::{debug, info};

use super::vit::VisionTransformer;
use crate::config::{AttentionType, ModelConfig};
use crate::error::{Result, TimesformerError};

/// Key under which training checkpoints nest their state dict.
pub const DEFAULT_STATE_KEY: &str = "model_state";

/// On-disk format of a weights artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    /// Safetensors file, memory-mapped.
    SafeTensors,
    /// PyTorch pickle (`torch.save` of a state dict).
    PyTorch,
}

impl WeightsFormat {
    /// Guess the format from the file extension. Unknown extensions are
    /// treated as safetensors.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .as_deref()
        {
            Some("pth" | "pt" | "pyth" | "bin") => Self::PyTorch,
            _ => Self::SafeTensors,
        }
    }
}

/// Scope a var builder to `prefix`; an empty prefix leaves it at the root.
pub(crate) fn scoped<'a>(vb: VarBuilder<'a>, prefix: &str) -> VarBuilder<'a> {
    if prefix.is_empty() {
        vb
    } else {
        vb.pp(prefix)
    }
}

fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Open a weights artifact for lazy parameter lookup.
///
/// Only the container is read here; parameter names and shapes are checked
/// when the network is built from the returned builder. PyTorch checkpoints
/// are read under `state_key` when given. Otherwise a flat state dict is read
/// from the root, and a checkpoint with no tensors at its root is read under
/// [`DEFAULT_STATE_KEY`].
pub fn open(
    path: &Path,
    state_key: Option<&str>,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        return Err(TimesformerError::FileNotFound(path.to_path_buf()));
    }

    let format = WeightsFormat::from_path(path);
    debug!("Opening {} as {:?}", path.display(), format);

    let vb = match format {
        // SAFETY: the file is memory-mapped and must not be modified while
        // the model is alive.
        WeightsFormat::SafeTensors => unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)
        },
        WeightsFormat::PyTorch => match resolve_state_key(path, state_key)? {
            Some(key) => {
                debug!("Reading state dict under '{}'", key);
                VarBuilder::from_pth_with_state(path, DType::F32, &key, device)
            }
            None => VarBuilder::from_pth(path, DType::F32, device),
        },
    };

    vb.map_err(|e| TimesformerError::model_load(format!("{}: {}", path.display(), e)))
}

/// Pick the pickle key holding the state dict, `None` for the root.
fn resolve_state_key(path: &Path, state_key: Option<&str>) -> Result<Option<String>> {
    if let Some(key) = state_key {
        return Ok(Some(key.to_string()));
    }
    let root = candle_core::pickle::read_pth_tensor_info(path, false, None)
        .map_err(|e| TimesformerError::model_load(format!("{}: {}", path.display(), e)))?;
    if root.is_empty() {
        Ok(Some(DEFAULT_STATE_KEY.to_string()))
    } else {
        Ok(None)
    }
}

/// Write a randomly initialised safetensors artifact for `config`.
///
/// The layout is exactly what [`open`] and the model loader expect, so the
/// artifact can stand in for pretrained weights in smoke tests.
pub fn init_random_weights(config: &ModelConfig, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    config.validate()?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    VisionTransformer::load(config, scoped(vb, &config.weights_prefix))
        .map_err(|e| TimesformerError::model_load(format!("Failed to build network: {}", e)))?;

    // Only the first block starts with an active temporal projection.
    if config.attention_type == AttentionType::DividedSpaceTime {
        let e = config.embed_dim;
        let zeros_w = Tensor::zeros((e, e), DType::F32, &Device::Cpu)
            .map_err(|e| TimesformerError::tensor(e.to_string()))?;
        let zeros_b = Tensor::zeros(e, DType::F32, &Device::Cpu)
            .map_err(|e| TimesformerError::tensor(e.to_string()))?;
        for i in 1..config.depth {
            let fc = format!("blocks.{}.temporal_fc", i);
            for (suffix, zeros) in [("weight", &zeros_w), ("bias", &zeros_b)] {
                let name = param_name(&config.weights_prefix, &format!("{}.{}", fc, suffix));
                varmap
                    .set_one(&name, zeros)
                    .map_err(|e| TimesformerError::model_load(format!("{}: {}", name, e)))?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path).map_err(|e| {
        TimesformerError::model_load(format!("Failed to save {}: {}", path.display(), e))
    })?;

    info!(
        "Wrote random weights for {} ({} classes) to {}",
        config.attention_type,
        config.num_classes,
        path.display()
    );
    Ok(())
}
