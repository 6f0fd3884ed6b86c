//! Configuration types for timesformer-rs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TimesformerError};

/// How attention is factorized across the spatial and temporal axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    /// Temporal attention followed by spatial attention in every block.
    #[default]
    DividedSpaceTime,
    /// A single attention over all space-time tokens.
    JointSpaceTime,
    /// Per-frame spatial attention; frames are averaged at the end.
    SpaceOnly,
}

impl AttentionType {
    /// Snake-case name as used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DividedSpaceTime => "divided_space_time",
            Self::JointSpaceTime => "joint_space_time",
            Self::SpaceOnly => "space_only",
        }
    }

    /// Whether the model carries a learned time embedding.
    pub fn has_time_embed(&self) -> bool {
        !matches!(self, Self::SpaceOnly)
    }
}

impl FromStr for AttentionType {
    type Err = TimesformerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "divided_space_time" => Ok(Self::DividedSpaceTime),
            "joint_space_time" => Ok(Self::JointSpaceTime),
            "space_only" => Ok(Self::SpaceOnly),
            other => Err(TimesformerError::config(format!(
                "Invalid attention type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AttentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Inference configuration.
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Model configuration.
///
/// Fully determines the architecture and where its parameters come from.
/// Defaults describe the ViT-Base/16 TimeSformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the pretrained weights artifact.
    #[serde(default)]
    pub weights_path: Option<PathBuf>,

    /// Name prefix of the parameters inside the artifact. Empty for none.
    #[serde(default = "default_weights_prefix")]
    pub weights_prefix: String,

    /// Key of the state dict inside a PyTorch checkpoint. When unset, flat
    /// checkpoints are read from the root and nested ones under
    /// `model_state`.
    #[serde(default)]
    pub state_key: Option<String>,

    /// Frame height and width in pixels.
    #[serde(default = "default_img_size")]
    pub img_size: usize,

    /// Side of the square patches cut from each frame.
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Channels per frame.
    #[serde(default = "default_in_chans")]
    pub in_chans: usize,

    /// Width of the classification head.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Frames sampled per clip.
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,

    /// Space-time attention layout of every block.
    #[serde(default)]
    pub attention_type: AttentionType,

    /// Token width.
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Number of transformer blocks.
    #[serde(default = "default_depth")]
    pub depth: usize,

    /// Attention heads per block.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// MLP hidden width as a multiple of `embed_dim`.
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    /// Whether the fused qkv projection has a bias.
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,

    /// Epsilon of every LayerNorm.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: None,
            weights_prefix: default_weights_prefix(),
            state_key: None,
            img_size: default_img_size(),
            patch_size: default_patch_size(),
            in_chans: default_in_chans(),
            num_classes: default_num_classes(),
            num_frames: default_num_frames(),
            attention_type: AttentionType::default(),
            embed_dim: default_embed_dim(),
            depth: default_depth(),
            num_heads: default_num_heads(),
            mlp_ratio: default_mlp_ratio(),
            qkv_bias: default_qkv_bias(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl ModelConfig {
    /// Patches along one side of a frame.
    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    /// Spatial patches per frame.
    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Hidden width of the MLP in every block.
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Width of one attention head.
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Check that the configuration describes a buildable architecture.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(TimesformerError::config("num_classes must be positive"));
        }
        if self.num_frames == 0 {
            return Err(TimesformerError::config("num_frames must be positive"));
        }
        if self.depth == 0 {
            return Err(TimesformerError::config("depth must be positive"));
        }
        if self.in_chans == 0 {
            return Err(TimesformerError::config("in_chans must be positive"));
        }
        if self.patch_size == 0 || self.img_size < self.patch_size {
            return Err(TimesformerError::config(format!(
                "patch_size {} does not fit img_size {}",
                self.patch_size, self.img_size
            )));
        }
        if self.img_size % self.patch_size != 0 {
            return Err(TimesformerError::config(format!(
                "img_size {} is not a multiple of patch_size {}",
                self.img_size, self.patch_size
            )));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(TimesformerError::config(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.mlp_hidden_dim() == 0 {
            return Err(TimesformerError::config("mlp_ratio yields an empty MLP"));
        }
        Ok(())
    }
}

/// Inference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Device to load the model on.
    #[serde(default = "default_device")]
    pub device: String,

    /// Number of synthetic clips per forward pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seed for synthetic clips. Unseeded runs use the thread RNG.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Accept clips whose frame count or frame size differ from the model
    /// and resize the learned embeddings to fit.
    #[serde(default)]
    pub allow_resize: bool,

    /// Number of top-scoring classes to report per clip.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            batch_size: default_batch_size(),
            seed: None,
            allow_resize: false,
            top_k: default_top_k(),
        }
    }
}

fn default_weights_prefix() -> String {
    "model".to_string()
}

fn default_img_size() -> usize {
    224
}

fn default_patch_size() -> usize {
    16
}

fn default_in_chans() -> usize {
    3
}

fn default_num_classes() -> usize {
    400
}

fn default_num_frames() -> usize {
    8
}

fn default_embed_dim() -> usize {
    768
}

fn default_depth() -> usize {
    12
}

fn default_num_heads() -> usize {
    12
}

fn default_mlp_ratio() -> f64 {
    4.0
}

fn default_qkv_bias() -> bool {
    true
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_top_k() -> usize {
    5
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TimesformerError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }
}
