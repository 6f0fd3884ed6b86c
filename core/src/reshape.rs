//! Frame flattening.
//!
//! A `(T, B, C, H, W)` stack of frames is scored as `T*B` independent rows of
//! `C*H*W` pixels. Two routes produce that matrix: one reshape straight to
//! two dimensions, or merging the leading axes first and collapsing every
//! frame on its own. Both must agree element for element.

use ndarray::{Array2, Array5, Axis};
use serde::Serialize;

use crate::clip::standard_normal;
use crate::error::{Result, TimesformerError};

fn shape_error(e: ndarray::ShapeError) -> TimesformerError {
    TimesformerError::tensor(format!("Array shape error: {}", e))
}

/// View `(T, B, C, H, W)` as `(T*B, C*H*W)` in a single reshape.
pub fn flatten_direct(x: &Array5<f32>) -> Result<Array2<f32>> {
    let (t, b, c, h, w) = x.dim();
    x.as_standard_layout()
        .into_owned()
        .into_shape_with_order((t * b, c * h * w))
        .map_err(shape_error)
}

/// Merge `(T, B)` into one axis, then collapse each frame's `(C, H, W)`.
pub fn flatten_staged(x: &Array5<f32>) -> Result<Array2<f32>> {
    let (t, b, c, h, w) = x.dim();
    let frames = x
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((t * b, c, h, w))
        .map_err(shape_error)?;

    let mut data = Vec::with_capacity(frames.len());
    for frame in frames.axis_iter(Axis(0)) {
        data.extend(frame.iter().copied());
    }
    Array2::from_shape_vec((t * b, c * h * w), data).map_err(shape_error)
}

/// Number of positions where `a` and `b` hold the same value.
///
/// Arrays of different shape share no positions.
pub fn count_equal(a: &Array2<f32>, b: &Array2<f32>) -> usize {
    if a.shape() != b.shape() {
        return 0;
    }
    a.iter().zip(b.iter()).filter(|(x, y)| x == y).count()
}

/// Outcome of comparing the two flattening routes.
#[derive(Debug, Clone, Serialize)]
pub struct FlattenReport {
    /// Input shape as `(T, B, C, H, W)`.
    pub shape: [usize; 5],
    /// Total element count of the input.
    pub elements: usize,
    /// Positions where both routes hold the same value.
    pub equal: usize,
}

impl FlattenReport {
    /// Whether the two routes agree everywhere.
    pub fn agrees(&self) -> bool {
        self.equal == self.elements
    }
}

/// Flatten a random `(T, B, C, H, W)` tensor both ways and compare.
pub fn check_flatten(shape: [usize; 5], seed: Option<u64>) -> Result<FlattenReport> {
    let [t, b, c, h, w] = shape;
    let x: Array5<f32> = standard_normal((t, b, c, h, w), seed);
    let direct = flatten_direct(&x)?;
    let staged = flatten_staged(&x)?;
    Ok(FlattenReport {
        shape,
        elements: x.len(),
        equal: count_equal(&direct, &staged),
    })
}
