//! TimeSformer vision transformer.
//!
//! A ViT backbone over video clips laid out as `(batch, channel, time,
//! height, width)`. Each frame is cut into non-overlapping patches; the patch
//! tokens of all frames then flow through blocks whose attention is factorized
//! according to [`AttentionType`].
//!
//! Parameter names follow the PyTorch checkpoints so that pretrained
//! weights load without renaming.

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, LayerNorm, Linear, VarBuilder};
use tracing::debug;

use crate::config::{AttentionType, ModelConfig};

/// Init for the learned cls/position/time embeddings when no artifact backs them.
const EMBED_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

/// Nearest-neighbour source indices for resizing `in_len` samples to `out_len`.
///
/// Matches `F.interpolate(..., mode="nearest")`: `src = floor(dst * in / out)`.
pub(crate) fn nearest_indices(in_len: usize, out_len: usize) -> Vec<u32> {
    let scale = in_len as f64 / out_len as f64;
    (0..out_len)
        .map(|i| ((i as f64 * scale).floor() as usize).min(in_len - 1) as u32)
        .collect()
}

/// Flat indices into a `grid x grid` patch layout for a `rows x cols` target.
fn nearest_grid_indices(grid: usize, rows: usize, cols: usize) -> Vec<u32> {
    let row_idx = nearest_indices(grid, rows);
    let col_idx = nearest_indices(grid, cols);
    row_idx
        .iter()
        .flat_map(|&r| col_idx.iter().map(move |&c| r * grid as u32 + c))
        .collect()
}

/// Frame-to-patch-token projection.
#[derive(Debug, Clone)]
struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn load(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let p = cfg.patch_size;
        let vb = vb.pp("proj");
        let conv_shape = (cfg.embed_dim, cfg.in_chans, p, p);
        let weight = match vb.get_with_hints(
            conv_shape,
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        ) {
            Ok(w) => w,
            // Some checkpoints store the projection as a linear layer over
            // flattened patches.
            Err(conv_err) => match vb.get((cfg.embed_dim, cfg.in_chans * p * p), "weight") {
                Ok(w) => {
                    debug!("patch_embed.proj.weight stored flattened, reshaping to conv layout");
                    w.reshape(conv_shape)?
                }
                Err(_) => return Err(conv_err),
            },
        };
        let bias = vb.get_with_hints(cfg.embed_dim, "bias", Init::Const(0.))?;
        let conv_cfg = Conv2dConfig {
            stride: p,
            ..Default::default()
        };
        Ok(Self {
            proj: Conv2d::new(weight, Some(bias), conv_cfg),
        })
    }

    /// `(b, c, t, h, w)` -> `(b*t, patches, embed)` plus the patch grid size.
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, usize, usize)> {
        let (b, c, t, h, w) = xs.dims5()?;
        let xs = xs.permute((0, 2, 1, 3, 4))?.reshape((b * t, c, h, w))?;
        let xs = self.proj.forward(&xs)?;
        let (_, _, grid_h, grid_w) = xs.dims4()?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        Ok((xs, grid_h, grid_w))
    }
}

/// Multi-head self-attention with a fused qkv projection.
#[derive(Debug, Clone)]
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    fn load(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let qkv = candle_nn::linear_b(dim, dim * 3, cfg.qkv_bias, vb.pp("qkv"))?;
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            num_heads: cfg.num_heads,
            scale: (cfg.head_dim() as f64).powf(-0.5),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let head_dim = c / self.num_heads;

        // (b, n, 3*c) -> (3, b, heads, n, head_dim)
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let attn = (q.matmul(&k.t()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&out)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn load(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.mlp_hidden_dim();
        Ok(Self {
            fc1: candle_nn::linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: candle_nn::linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?.gelu_erf()?;
        self.fc2.forward(&xs)
    }
}

/// Temporal attention branch of a divided space-time block.
#[derive(Debug, Clone)]
struct TemporalBranch {
    norm: LayerNorm,
    attn: Attention,
    fc: Linear,
}

#[derive(Debug, Clone)]
struct Block {
    attention_type: AttentionType,
    norm1: LayerNorm,
    attn: Attention,
    temporal: Option<TemporalBranch>,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let eps = cfg.layer_norm_eps;
        let temporal = if cfg.attention_type == AttentionType::DividedSpaceTime {
            Some(TemporalBranch {
                norm: candle_nn::layer_norm(dim, eps, vb.pp("temporal_norm1"))?,
                attn: Attention::load(cfg, vb.pp("temporal_attn"))?,
                fc: candle_nn::linear(dim, dim, vb.pp("temporal_fc"))?,
            })
        } else {
            None
        };
        Ok(Self {
            attention_type: cfg.attention_type,
            norm1: candle_nn::layer_norm(dim, eps, vb.pp("norm1"))?,
            attn: Attention::load(cfg, vb.pp("attn"))?,
            temporal,
            norm2: candle_nn::layer_norm(dim, eps, vb.pp("norm2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    /// `xs` is `(b, 1 + n*t, e)` for the space-time variants and
    /// `(b*t, 1 + n, e)` for space-only.
    fn forward(&self, xs: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        match (&self.temporal, self.attention_type) {
            (Some(temporal), AttentionType::DividedSpaceTime) => {
                self.forward_divided(temporal, xs, b, t)
            }
            _ => {
                let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?)?)?;
                &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
            }
        }
    }

    fn forward_divided(
        &self,
        temporal: &TemporalBranch,
        xs: &Tensor,
        b: usize,
        t: usize,
    ) -> Result<Tensor> {
        let (_, tokens, e) = xs.dims3()?;
        let n = (tokens - 1) / t;
        let patches = xs.i((.., 1.., ..))?;

        // Temporal: every patch position attends over its own frames.
        let xt = patches.reshape((b * n, t, e))?;
        let res_t = temporal.attn.forward(&temporal.norm.forward(&xt)?)?;
        let res_t = temporal.fc.forward(&res_t.reshape((b, n * t, e))?)?;
        let xt = (&patches + res_t)?;

        // Spatial: every frame attends over its patches plus a copy of the cls token.
        let init_cls = xs.i((.., 0..1, ..))?;
        let cls = init_cls.broadcast_as((b, t, e))?.reshape((b * t, 1, e))?;
        let xs_frames = xt
            .reshape((b, n, t, e))?
            .permute((0, 2, 1, 3))?
            .reshape((b * t, n, e))?;
        let xs_frames = Tensor::cat(&[&cls, &xs_frames], 1)?;
        let res_s = self.attn.forward(&self.norm1.forward(&xs_frames)?)?;

        // Per-frame cls results are averaged back into one token per clip.
        let cls = res_s.i((.., 0, ..))?.reshape((b, t, e))?.mean_keepdim(1)?;
        let res_s = res_s
            .i((.., 1.., ..))?
            .reshape((b, t, n, e))?
            .permute((0, 2, 1, 3))?
            .reshape((b, n * t, e))?;

        let xs = (Tensor::cat(&[&init_cls, &xt], 1)? + Tensor::cat(&[&cls, &res_s], 1)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

/// The full classifier: patch embedding, transformer blocks and linear head.
#[derive(Debug, Clone)]
pub struct VisionTransformer {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    pos_embed: Tensor,
    time_embed: Option<Tensor>,
    blocks: Vec<Block>,
    norm: LayerNorm,
    head: Linear,
    attention_type: AttentionType,
    grid_size: usize,
    num_frames: usize,
}

impl VisionTransformer {
    /// Resolve every parameter of the architecture described by `cfg` from `vb`.
    pub fn load(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let e = cfg.embed_dim;
        let patch_embed = PatchEmbed::load(cfg, vb.pp("patch_embed"))?;
        let cls_token = vb.get_with_hints((1, 1, e), "cls_token", EMBED_INIT)?;
        let pos_embed = vb.get_with_hints((1, cfg.num_patches() + 1, e), "pos_embed", EMBED_INIT)?;
        let time_embed = if cfg.attention_type.has_time_embed() {
            Some(vb.get_with_hints((1, cfg.num_frames, e), "time_embed", EMBED_INIT)?)
        } else {
            None
        };

        let vb_blocks = vb.pp("blocks");
        let blocks = (0..cfg.depth)
            .map(|i| Block::load(cfg, vb_blocks.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let norm = candle_nn::layer_norm(e, cfg.layer_norm_eps, vb.pp("norm"))?;
        let head = candle_nn::linear(e, cfg.num_classes, vb.pp("head"))?;

        debug!(
            "VisionTransformer: {} blocks, embed_dim={}, grid={}x{}, frames={}, attention={}",
            blocks.len(),
            e,
            cfg.grid_size(),
            cfg.grid_size(),
            cfg.num_frames,
            cfg.attention_type
        );

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            time_embed,
            blocks,
            norm,
            head,
            attention_type: cfg.attention_type,
            grid_size: cfg.grid_size(),
            num_frames: cfg.num_frames,
        })
    }

    /// Positional embedding for a `grid_h x grid_w` patch grid.
    ///
    /// The learned table is used as is whenever the token count matches,
    /// even if the grid has another aspect ratio.
    fn pos_embed_for(&self, grid_h: usize, grid_w: usize) -> Result<Tensor> {
        if 1 + grid_h * grid_w == self.pos_embed.dim(1)? {
            return Ok(self.pos_embed.clone());
        }
        debug!(
            "Resizing pos_embed from {}x{} to {}x{}",
            self.grid_size, self.grid_size, grid_h, grid_w
        );
        let cls = self.pos_embed.i((.., 0..1, ..))?;
        let grid = self.pos_embed.i((.., 1.., ..))?.contiguous()?;
        let idx = nearest_grid_indices(self.grid_size, grid_h, grid_w);
        let idx = Tensor::from_vec(idx, grid_h * grid_w, self.pos_embed.device())?;
        Tensor::cat(&[&cls, &grid.index_select(&idx, 1)?], 1)
    }

    /// Time embedding for `t` frames.
    fn time_embed_for(time_embed: &Tensor, num_frames: usize, t: usize) -> Result<Tensor> {
        if t == num_frames {
            return Ok(time_embed.clone());
        }
        debug!("Resizing time_embed from {} to {} frames", num_frames, t);
        let idx = Tensor::from_vec(nearest_indices(num_frames, t), t, time_embed.device())?;
        time_embed.index_select(&idx, 1)
    }

    /// Class-token features after the final norm, `(b, embed)`.
    pub fn forward_features(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, t, _, _) = xs.dims5()?;
        let (xs, grid_h, grid_w) = self.patch_embed.forward(xs)?;
        let (bt, n, e) = xs.dims3()?;

        let cls = self.cls_token.broadcast_as((bt, 1, e))?.contiguous()?;
        let xs = Tensor::cat(&[&cls, &xs], 1)?;
        let xs = xs.broadcast_add(&self.pos_embed_for(grid_h, grid_w)?)?;

        let mut xs = match &self.time_embed {
            Some(time_embed) => {
                // cls rows are identical across frames at this point.
                let cls = xs.i((0..b, 0..1, ..))?;
                let tokens = xs
                    .i((.., 1.., ..))?
                    .reshape((b, t, n, e))?
                    .permute((0, 2, 1, 3))?
                    .reshape((b * n, t, e))?;
                let time_embed = Self::time_embed_for(time_embed, self.num_frames, t)?;
                let tokens = tokens.broadcast_add(&time_embed)?.reshape((b, n * t, e))?;
                Tensor::cat(&[&cls, &tokens], 1)?
            }
            None => xs,
        };

        for block in &self.blocks {
            xs = block.forward(&xs, b, t)?;
        }

        if self.attention_type == AttentionType::SpaceOnly {
            let (_, tokens, e) = xs.dims3()?;
            xs = xs.reshape((b, t, tokens, e))?.mean(1)?;
        }

        self.norm.forward(&xs)?.i((.., 0, ..))
    }
}

impl Module for VisionTransformer {
    /// `(b, c, t, h, w)` clips to `(b, num_classes)` logits.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.head.forward(&self.forward_features(xs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config(attention_type: AttentionType) -> ModelConfig {
        ModelConfig {
            img_size: 32,
            patch_size: 16,
            num_classes: 5,
            num_frames: 3,
            attention_type,
            embed_dim: 16,
            depth: 2,
            num_heads: 2,
            ..ModelConfig::default()
        }
    }

    fn build(cfg: &ModelConfig) -> (VarMap, VisionTransformer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = VisionTransformer::load(cfg, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn test_nearest_indices_match_torch() {
        assert_eq!(nearest_indices(8, 4), vec![0, 2, 4, 6]);
        assert_eq!(nearest_indices(4, 8), vec![0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(nearest_indices(4, 3), vec![0, 1, 2]);
        assert_eq!(nearest_indices(5, 5), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_nearest_grid_indices() {
        // 2x2 grid upsampled to 3x4.
        let idx = nearest_grid_indices(2, 3, 4);
        assert_eq!(idx, vec![0, 0, 1, 1, 0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_forward_shape_all_attention_types() {
        for attention_type in [
            AttentionType::DividedSpaceTime,
            AttentionType::JointSpaceTime,
            AttentionType::SpaceOnly,
        ] {
            let cfg = tiny_config(attention_type);
            let (_varmap, model) = build(&cfg);
            let xs = Tensor::randn(0f32, 1., (2, 3, 3, 32, 32), &Device::Cpu).unwrap();
            let logits = model.forward(&xs).unwrap();
            assert_eq!(logits.dims(), &[2, 5], "attention type {}", attention_type);
        }
    }

    #[test]
    fn test_space_only_has_no_temporal_parameters() {
        let (varmap, _) = build(&tiny_config(AttentionType::SpaceOnly));
        let data = varmap.data().lock().unwrap();
        assert!(!data.contains_key("time_embed"));
        assert!(!data.keys().any(|k| k.contains("temporal")));
        assert!(data.contains_key("blocks.1.attn.qkv.weight"));
    }

    #[test]
    fn test_divided_has_temporal_parameters() {
        let (varmap, _) = build(&tiny_config(AttentionType::DividedSpaceTime));
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["time_embed"].dims(), &[1, 3, 16]);
        assert_eq!(data["pos_embed"].dims(), &[1, 5, 16]);
        assert_eq!(data["blocks.0.temporal_fc.weight"].dims(), &[16, 16]);
        assert_eq!(data["blocks.1.attn.qkv.weight"].dims(), &[48, 16]);
        assert_eq!(data["blocks.1.mlp.fc1.weight"].dims(), &[64, 16]);
        assert_eq!(data["patch_embed.proj.weight"].dims(), &[16, 3, 16, 16]);
        assert_eq!(data["head.weight"].dims(), &[5, 16]);
    }

    #[test]
    fn test_resized_embeddings_keep_output_shape() {
        let cfg = tiny_config(AttentionType::DividedSpaceTime);
        let (_varmap, model) = build(&cfg);
        // 5 frames of 48x64 instead of 3 frames of 32x32.
        let xs = Tensor::randn(0f32, 1., (1, 3, 5, 48, 64), &Device::Cpu).unwrap();
        let logits = model.forward(&xs).unwrap();
        assert_eq!(logits.dims(), &[1, 5]);
    }

    #[test]
    fn test_pos_embed_resized_only_when_token_count_differs() {
        let (_varmap, model) = build(&tiny_config(AttentionType::DividedSpaceTime));
        let max_diff = |a: &Tensor, b: &Tensor| {
            (a - b)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        };

        // A 1x4 grid has as many tokens as the trained 2x2 grid.
        let wide = model.pos_embed_for(1, 4).unwrap();
        assert_eq!(wide.dims(), &[1, 5, 16]);
        assert_eq!(max_diff(&wide, &model.pos_embed), 0.0);

        let larger = model.pos_embed_for(3, 3).unwrap();
        assert_eq!(larger.dims(), &[1, 10, 16]);
        let cls = model.pos_embed.i((.., 0..1, ..)).unwrap();
        assert_eq!(max_diff(&larger.i((.., 0..1, ..)).unwrap(), &cls), 0.0);
        // Bottom-right token of a 3x3 grid maps back to the last trained patch.
        let last = model.pos_embed.i((.., 4..5, ..)).unwrap();
        assert_eq!(max_diff(&larger.i((.., 9..10, ..)).unwrap(), &last), 0.0);
    }
}
