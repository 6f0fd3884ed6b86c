//! Clip tensors: synthetic generation and JSON loading.

use ndarray::{Array, Array5, ArrayD, Dimension, IxDyn, ShapeBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::Deserialize;
use std::path::Path;

use crate::config::ModelConfig;
use crate::error::{Result, TimesformerError};

/// Shape of a clip batch, `(batch, channels, frames, height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipShape {
    /// Clips in the batch.
    pub batch: usize,
    /// Channels per frame.
    pub channels: usize,
    /// Frames per clip.
    pub frames: usize,
    /// Frame height in pixels.
    pub height: usize,
    /// Frame width in pixels.
    pub width: usize,
}

impl ClipShape {
    /// The clip shape a model built from `config` expects.
    pub fn for_config(batch: usize, config: &ModelConfig) -> Self {
        Self {
            batch,
            channels: config.in_chans,
            frames: config.num_frames,
            height: config.img_size,
            width: config.img_size,
        }
    }

    /// Dimensions in `(B, C, T, H, W)` order.
    pub fn dims(&self) -> (usize, usize, usize, usize, usize) {
        (self.batch, self.channels, self.frames, self.height, self.width)
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.batch * self.channels * self.frames * self.height * self.width
    }
}

fn sample_into<R, Sh>(rng: &mut R, shape: Sh) -> Array<f32, Sh::Dim>
where
    R: Rng,
    Sh: ShapeBuilder,
{
    Array::from_shape_simple_fn(shape, || rng.sample::<f32, _>(StandardNormal))
}

/// Standard-normal array of any shape. Seeded calls are reproducible.
pub fn standard_normal<Sh>(shape: Sh, seed: Option<u64>) -> Array<f32, Sh::Dim>
where
    Sh: ShapeBuilder,
{
    match seed {
        Some(seed) => sample_into(&mut StdRng::seed_from_u64(seed), shape),
        None => sample_into(&mut rand::thread_rng(), shape),
    }
}

/// Synthetic clip batch drawn from a standard normal distribution.
pub fn synthetic_clip(shape: ClipShape, seed: Option<u64>) -> Array5<f32> {
    standard_normal(shape.dims(), seed)
}

/// Clip tensor as stored in JSON input files.
#[derive(Debug, Deserialize)]
struct ClipJson {
    data: Vec<f32>,
    shape: Vec<usize>,
}

/// Parse a clip from `{ "data": [...], "shape": [B, C, T, H, W] }`.
pub fn clip_from_json_str(json: &str) -> Result<ArrayD<f32>> {
    let clip: ClipJson = serde_json::from_str(json)?;
    let dim = IxDyn(&clip.shape);
    if dim.size() != clip.data.len() {
        return Err(TimesformerError::tensor(format!(
            "shape {:?} needs {} values, got {}",
            clip.shape,
            dim.size(),
            clip.data.len()
        )));
    }
    ArrayD::from_shape_vec(dim, clip.data)
        .map_err(|e| TimesformerError::tensor(format!("Array shape error: {}", e)))
}

/// Read a clip JSON file.
pub fn load_clip_json(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(TimesformerError::FileNotFound(path.to_path_buf()));
    }
    clip_from_json_str(&std::fs::read_to_string(path)?)
}
