//! Model inference module.
//!
//! This module holds the TimeSformer network, weight artifact handling,
//! and the safe model wrapper used for loading and inference.

mod model;
mod vit;
pub mod weights;

pub use model::{test_device, Device, InferenceResult, TimesformerModel};
pub use vit::VisionTransformer;
pub use weights::{init_random_weights, WeightsFormat, DEFAULT_STATE_KEY};
