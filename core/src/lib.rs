//! timesformer-rs: Load pretrained TimeSformer video classifiers and run inference.
//!
//! TimeSformer is a ViT-Base backbone applied to video clips, with attention
//! factorized over space and time. This crate builds the network on top of
//! candle, fills it from a pretrained weights artifact, and scores clip
//! batches shaped `(batch, channel, time, height, width)`.
//!
//! # Features
//!
//! - **cuda**: Enable CUDA GPU support (requires the CUDA toolkit)
//!
//! # Example
//!
//! ```ignore
//! use timesformer_rs::clip::{synthetic_clip, ClipShape};
//! use timesformer_rs::config::{AttentionType, ModelConfig};
//! use timesformer_rs::inference::{Device, TimesformerModel};
//!
//! let config = ModelConfig {
//!     img_size: 224,
//!     num_classes: 600,
//!     num_frames: 8,
//!     attention_type: AttentionType::DividedSpaceTime,
//!     weights_path: Some("TimeSformer_divST_8x32_224_K600.safetensors".into()),
//!     ..ModelConfig::default()
//! };
//!
//! // Load model
//! let model = TimesformerModel::load(&config, Device::cpu())?;
//!
//! // Two random clips (B, C, T, H, W)
//! let clips = synthetic_clip(ClipShape::for_config(2, &config), None);
//!
//! // Run inference
//! let result = model.infer(&clips)?;
//! assert_eq!(result.shape(), &[2, 600]);
//! ```
//!
//! # Weights
//!
//! Safetensors artifacts are memory-mapped. PyTorch pickles (`.pth`,
//! `.pyth`) are read directly, either as a flat state dict or from the entry
//! named by `ModelConfig::state_key` (`model_state` when the root holds no
//! tensors, as in the upstream training checkpoints). Parameter names are looked up under `ModelConfig::weights_prefix`
//! (`model` by default, matching the upstream checkpoints).
//!
//! ```bash
//! # Random weights for a smoke test
//! timesformer-rs init-weights --output /tmp/random.safetensors
//! timesformer-rs infer --weights /tmp/random.safetensors --batch-size 2
//! ```

pub mod cli;
pub mod clip;
pub mod config;
pub mod error;
pub mod inference;
pub mod reshape;

// Re-export commonly used types
pub use config::{AttentionType, Config, ModelConfig};
pub use error::{Result, TimesformerError};
pub use inference::{Device, InferenceResult, TimesformerModel};
