//! Model construction and inference.
//!
//! [`TimesformerModel`] ties a [`ModelConfig`] to the parameters read from a
//! weights artifact and exposes a single forward pass over `ndarray` clips.

use candle_core::{DType, Module, Tensor};
use ndarray::{Array, Array2, Dimension};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info};

use super::vit::VisionTransformer;
use super::weights;
use crate::config::ModelConfig;
use crate::error::{Result, TimesformerError};

/// Device specification for model inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// CPU device.
    Cpu,
    /// CUDA device with index.
    Cuda(usize),
}

impl Device {
    /// Create a CPU device.
    pub fn cpu() -> Self {
        Self::Cpu
    }

    /// Create a CUDA device with the given index.
    pub fn cuda(index: usize) -> Self {
        Self::Cuda(index)
    }

    /// Open the tensor backend device.
    ///
    /// CUDA devices fail unless the crate is built with the `cuda` feature.
    pub fn to_candle(&self) -> Result<candle_core::Device> {
        match self {
            Self::Cpu => Ok(candle_core::Device::Cpu),
            Self::Cuda(idx) => candle_core::Device::new_cuda(*idx)
                .map_err(|e| TimesformerError::config(format!("Cannot open {}: {}", self, e))),
        }
    }
}

impl FromStr for Device {
    type Err = TimesformerError;

    /// Parse a device string like "cpu", "cuda", "cuda:0", "cuda:1".
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            Ok(Self::Cpu)
        } else if s == "cuda" {
            Ok(Self::Cuda(0))
        } else if let Some(idx) = s.strip_prefix("cuda:") {
            let index: usize = idx
                .parse()
                .map_err(|_| TimesformerError::config(format!("Invalid CUDA index: {}", idx)))?;
            Ok(Self::Cuda(index))
        } else {
            Err(TimesformerError::config(format!("Invalid device: {}", s)))
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{}", idx),
        }
    }
}

/// Result of model inference.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// Class scores, one row per clip and one column per class.
    pub predictions: Array2<f32>,
    /// Inference latency in milliseconds.
    pub latency_ms: f64,
}

impl InferenceResult {
    /// Shape of the prediction tensor, `[batch, num_classes]`.
    pub fn shape(&self) -> &[usize] {
        self.predictions.shape()
    }

    /// Number of clips scored.
    pub fn batch_size(&self) -> usize {
        self.predictions.nrows()
    }

    /// The `k` highest-scoring `(class, score)` pairs of every clip, best first.
    pub fn top_k(&self, k: usize) -> Vec<Vec<(usize, f32)>> {
        self.predictions
            .rows()
            .into_iter()
            .map(|row| {
                let mut scored: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
                scored.sort_by(|a, b| b.1.total_cmp(&a.1));
                scored.truncate(k);
                scored
            })
            .collect()
    }
}

/// Pretrained TimeSformer classifier.
///
/// Parameters are resolved in full at construction and never mutated, so a
/// model can be shared freely between callers.
///
/// # Example
///
/// ```ignore
/// use timesformer_rs::clip::{synthetic_clip, ClipShape};
/// use timesformer_rs::config::{AttentionType, ModelConfig};
/// use timesformer_rs::inference::{Device, TimesformerModel};
///
/// let config = ModelConfig {
///     num_classes: 600,
///     attention_type: AttentionType::DividedSpaceTime,
///     weights_path: Some("TimeSformer_divST_8x32_224_K600.safetensors".into()),
///     ..ModelConfig::default()
/// };
/// let model = TimesformerModel::load(&config, Device::cpu())?;
///
/// let clips = synthetic_clip(ClipShape::for_config(2, &config), None);
/// let result = model.infer(&clips)?;
/// assert_eq!(result.shape(), &[2, 600]);
/// ```
pub struct TimesformerModel {
    network: VisionTransformer,
    config: ModelConfig,
    device: Device,
    backend: candle_core::Device,
    allow_resize: bool,
}

impl TimesformerModel {
    /// Build a model from `config`, reading parameters from its weights path.
    ///
    /// # Errors
    ///
    /// - [`TimesformerError::FileNotFound`] if the weights file does not exist.
    /// - [`TimesformerError::ModelLoad`] if the artifact cannot be read.
    /// - [`TimesformerError::WeightsMismatch`] if a parameter is missing or
    ///   its shape disagrees with the configured architecture.
    pub fn load(config: &ModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let path = config
            .weights_path
            .as_deref()
            .ok_or_else(|| TimesformerError::config("No weights path configured"))?;

        let backend = device.to_candle()?;
        info!("Loading weights from {} on {}", path.display(), device);
        let vb = weights::open(path, config.state_key.as_deref(), &backend)?;

        let network = VisionTransformer::load(config, weights::scoped(vb, &config.weights_prefix))
            .map_err(|e| TimesformerError::weights_mismatch(format!("{}: {}", path.display(), e)))?;

        debug!(
            "Built {} model: {} classes, {} frames of {}x{}",
            config.attention_type,
            config.num_classes,
            config.num_frames,
            config.img_size,
            config.img_size
        );

        Ok(Self {
            network,
            config: config.clone(),
            device,
            backend,
            allow_resize: false,
        })
    }

    /// Accept clips whose frame count or frame size differ from the
    /// configuration, resizing the learned embeddings to fit.
    pub fn with_resize(mut self, allow: bool) -> Self {
        self.allow_resize = allow;
        self
    }

    /// Get the configuration this model was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get the device this model is loaded on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Reject clips the model cannot score.
    fn check_input(&self, shape: &[usize]) -> Result<()> {
        let cfg = &self.config;
        let &[batch, channels, frames, height, width] = shape else {
            return Err(TimesformerError::shape_mismatch(format!(
                "expected (batch, channel, time, height, width), got {:?}",
                shape
            )));
        };

        if batch == 0 {
            return Err(TimesformerError::shape_mismatch("empty batch"));
        }
        if channels != cfg.in_chans {
            return Err(TimesformerError::shape_mismatch(format!(
                "expected {} channels, got {}",
                cfg.in_chans, channels
            )));
        }

        if self.allow_resize {
            if frames == 0 {
                return Err(TimesformerError::shape_mismatch("clip has no frames"));
            }
            for (axis, len) in [("height", height), ("width", width)] {
                if len < cfg.patch_size || len % cfg.patch_size != 0 {
                    return Err(TimesformerError::shape_mismatch(format!(
                        "{} {} is not a positive multiple of patch size {}",
                        axis, len, cfg.patch_size
                    )));
                }
            }
        } else if (frames, height, width) != (cfg.num_frames, cfg.img_size, cfg.img_size) {
            return Err(TimesformerError::shape_mismatch(format!(
                "model expects {} frames of {}x{}, got {} frames of {}x{}",
                cfg.num_frames, cfg.img_size, cfg.img_size, frames, height, width
            )));
        }

        Ok(())
    }

    /// Run one forward pass.
    ///
    /// # Arguments
    ///
    /// * `input` - Clip batch shaped `(batch, channel, time, height, width)`
    ///
    /// # Errors
    ///
    /// Returns [`TimesformerError::ShapeMismatch`] for clips the model cannot
    /// score and [`TimesformerError::ShapeViolation`] if the output is not
    /// `(batch, num_classes)`.
    pub fn infer<D: Dimension>(&self, input: &Array<f32, D>) -> Result<InferenceResult> {
        let shape = input.shape().to_vec();
        self.check_input(&shape)?;
        let batch = shape[0];

        // Ensure data is contiguous
        let contiguous = input.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| TimesformerError::tensor("Input is not contiguous"))?;

        let start = Instant::now();
        let clips = Tensor::from_slice(data, shape.as_slice(), &self.backend)
            .map_err(|e| TimesformerError::tensor(format!("Failed to create input tensor: {}", e)))?;
        let logits = self
            .network
            .forward(&clips)
            .map_err(|e| TimesformerError::inference(e.to_string()))?;

        let expected = vec![batch, self.config.num_classes];
        if logits.dims() != expected.as_slice() {
            return Err(TimesformerError::ShapeViolation {
                expected,
                actual: logits.dims().to_vec(),
            });
        }

        let values = logits
            .to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| TimesformerError::tensor(format!("Failed to read logits: {}", e)))?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let predictions = Array2::from_shape_vec((batch, self.config.num_classes), values)
            .map_err(|e| TimesformerError::tensor(format!("Array shape error: {}", e)))?;

        debug!("Scored {} clips in {:.2}ms", batch, latency_ms);

        Ok(InferenceResult {
            predictions,
            latency_ms,
        })
    }
}

/// Run basic tensor operations on a device.
///
/// Exercises allocation, matmul and reductions so that a broken backend is
/// caught before a model is loaded. Returns a short report on success.
pub fn test_device(device: &Device) -> Result<String> {
    let backend = device.to_candle()?;
    let run = || -> candle_core::Result<String> {
        let mut report = vec![format!("device: {}", device)];

        let a = Tensor::arange(0f32, 6., &backend)?.reshape((2, 3))?;
        let b = Tensor::ones((3, 2), DType::F32, &backend)?;
        let product = a.matmul(&b)?.to_vec2::<f32>()?;
        report.push(format!("matmul: {:?}", product));

        let sum = a.sum_all()?.to_scalar::<f32>()?;
        report.push(format!("sum: {}", sum));

        let softmax = candle_nn::ops::softmax_last_dim(&a)?.sum(1)?.to_vec1::<f32>()?;
        report.push(format!("softmax row sums: {:?}", softmax));

        let zeros = Tensor::zeros((4, 4), DType::F32, &backend)?;
        report.push(format!("zeros: {:?}", zeros.dims()));
        Ok(report.join("\n"))
    };
    run().map_err(|e| TimesformerError::inference(format!("Device test failed: {}", e)))
}
