//! Error types for timesformer-rs.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for timesformer-rs operations.
pub type Result<T> = std::result::Result<T, TimesformerError>;

/// Errors that can occur while loading a model or running inference.
#[derive(Debug, Error)]
pub enum TimesformerError {
    /// The weights artifact could not be deserialized.
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    /// The weights artifact does not match the configured architecture.
    #[error("Weights do not match architecture: {0}")]
    WeightsMismatch(String),

    /// The input clip tensor is not acceptable for this model.
    #[error("Input shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The model produced an output of unexpected shape.
    #[error("Output shape violation: expected {expected:?}, got {actual:?}")]
    ShapeViolation {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Inference failed.
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    Tensor(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl TimesformerError {
    /// Create a model load error.
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    /// Create a weights mismatch error.
    pub fn weights_mismatch(msg: impl Into<String>) -> Self {
        Self::WeightsMismatch(msg.into())
    }

    /// Create an input shape mismatch error.
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create an inference error.
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a tensor error.
    pub fn tensor(msg: impl Into<String>) -> Self {
        Self::Tensor(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
