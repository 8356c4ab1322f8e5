//! Multi-head self-attention with learned relative position embeddings.
//!
//! Shaw-style relative attention as used by the VITS / Glow-TTS text encoders.
//! Each head owns two `[H, 2W+1, Dh]` tables (keys and values) indexed by the
//! offset `j - i` between query `i` and key `j`, clipped to the window `±W`:
//!
//! ```text
//! scores  = (Q·Kᵀ + rel_to_abs(Q·E_kᵀ)) / √Dh          [B, H, L, L]
//! weights = softmax(mask(scores))
//! out     = weights·V + abs_to_rel(weights)·E_v         [B, H, L, Dh]
//! ```
//!
//! The relative scores are computed once per offset (`[B, H, L, 2L-1]`) and
//! skewed into absolute `(query, key)` layout by a pad/reshape trick, so no
//! `[L, L, Dh]` position table is ever built.
//!
//! ## Weight key paths
//!
//! ```text
//! conv_q.{weight,bias}     Conv1d(C, C, 1)
//! conv_k.{weight,bias}     Conv1d(C, C, 1)
//! conv_v.{weight,bias}     Conv1d(C, C, 1)
//! conv_o.{weight,bias}     Conv1d(C, C_out, 1)
//! emb_rel_k                (H, 2W+1, Dh)
//! emb_rel_v                (H, 2W+1, Dh)
//! ```

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Conv1d, Dropout, VarBuilder};

use super::mask::{self, MASK_SENTINEL};
use crate::{Error, Result};

/// Hyper-parameters of one attention layer.
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    pub channels: usize,
    pub out_channels: usize,
    pub num_heads: usize,
    /// Relative window radius `W`; `None` disables relative embeddings.
    pub window_size: Option<usize>,
    pub dropout: f32,
    pub proximal_bias: bool,
    pub block_length: Option<usize>,
}

/// Learned relative embedding tables of one layer.
#[derive(Debug, Clone)]
struct RelativeEmbeddings {
    window: usize,
    /// `[H, 2W+1, Dh]`
    key: Tensor,
    /// `[H, 2W+1, Dh]`
    value: Tensor,
}

impl RelativeEmbeddings {
    /// Slice (or zero-pad) a `[H, 2W+1, Dh]` table to exactly `[H, 2L-1, Dh]`.
    ///
    /// Offsets within `±W` keep their learned vector; offsets beyond the
    /// window get a zero vector.
    fn window_for(&self, table: &Tensor, len: usize) -> candle_core::Result<Tensor> {
        let pad = len.saturating_sub(self.window + 1);
        let start = (self.window + 1).saturating_sub(len);
        let table = if pad > 0 {
            table.pad_with_zeros(1, pad, pad)?
        } else {
            table.clone()
        };
        table.narrow(1, start, 2 * len - 1)
    }
}

/// Skew relative scores `[B, H, L, 2L-1]` into absolute layout `[B, H, L, L]`.
///
/// `out[.., i, j] = x[.., i, (j - i) + (L - 1)]`.
pub fn relative_to_absolute(x: &Tensor) -> Result<Tensor> {
    let (b, h, l, width) = x.dims4()?;
    if l == 0 || width != 2 * l - 1 {
        return Err(Error::shape_desc(
            "relative_to_absolute",
            "[B, H, L, 2L-1] with L > 0",
            x.dims(),
        ));
    }
    // One zero column: [B, H, L, 2L]
    let x = x.pad_with_zeros(3, 0, 1)?;
    // Flatten and pad so the rows re-wrap shifted by one: [B, H, (L+1)(2L-1)]
    let x = x.reshape((b, h, l * 2 * l))?;
    let x = x.pad_with_zeros(2, 0, l - 1)?;
    let x = x.reshape((b, h, l + 1, 2 * l - 1))?;
    Ok(x.narrow(2, 0, l)?.narrow(3, l - 1, l)?.contiguous()?)
}

/// Inverse of [`relative_to_absolute`]: `[B, H, L, L]` → `[B, H, L, 2L-1]`.
///
/// `out[.., i, r] = x[.., i, i + r - (L - 1)]` when that key exists, else 0.
pub fn absolute_to_relative(x: &Tensor) -> Result<Tensor> {
    let (b, h, l, cols) = x.dims4()?;
    if l == 0 || cols != l {
        return Err(Error::shape_desc(
            "absolute_to_relative",
            "[B, H, L, L] with L > 0",
            x.dims(),
        ));
    }
    // Pad columns to 2L-1, flatten, then prepend L zeros to skew each row.
    let x = x.pad_with_zeros(3, 0, l - 1)?;
    let x = x.reshape((b, h, l * (2 * l - 1)))?;
    let x = x.pad_with_zeros(2, l, 0)?;
    let x = x.reshape((b, h, l, 2 * l))?;
    Ok(x.narrow(3, 1, 2 * l - 1)?.contiguous()?)
}

/// Multi-head self-attention over channel-first sequences `[B, C, L]`.
#[derive(Debug, Clone)]
pub struct RelativePositionAttention {
    conv_q: Conv1d,
    conv_k: Conv1d,
    conv_v: Conv1d,
    conv_o: Conv1d,
    relative: Option<RelativeEmbeddings>,
    dropout: Dropout,
    channels: usize,
    num_heads: usize,
    head_channels: usize,
    proximal_bias: bool,
    block_length: Option<usize>,
}

impl RelativePositionAttention {
    pub fn new(cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.num_heads == 0 || cfg.channels % cfg.num_heads != 0 {
            return Err(Error::shape_desc(
                "attention heads",
                format!("channels divisible by num_heads={}", cfg.num_heads),
                cfg.channels,
            ));
        }
        let head_channels = cfg.channels / cfg.num_heads;

        let pointwise = candle_nn::Conv1dConfig::default();
        let conv_q = candle_nn::conv1d(cfg.channels, cfg.channels, 1, pointwise, vb.pp("conv_q"))?;
        let conv_k = candle_nn::conv1d(cfg.channels, cfg.channels, 1, pointwise, vb.pp("conv_k"))?;
        let conv_v = candle_nn::conv1d(cfg.channels, cfg.channels, 1, pointwise, vb.pp("conv_v"))?;
        let conv_o = candle_nn::conv1d(
            cfg.channels,
            cfg.out_channels,
            1,
            pointwise,
            vb.pp("conv_o"),
        )?;

        let relative = match cfg.window_size {
            Some(window) => {
                let init = candle_nn::Init::Randn {
                    mean: 0.0,
                    stdev: (head_channels as f64).powf(-0.5),
                };
                let shape = (cfg.num_heads, 2 * window + 1, head_channels);
                Some(RelativeEmbeddings {
                    window,
                    key: vb.get_with_hints(shape, "emb_rel_k", init)?,
                    value: vb.get_with_hints(shape, "emb_rel_v", init)?,
                })
            }
            None => None,
        };

        Ok(Self {
            conv_q,
            conv_k,
            conv_v,
            conv_o,
            relative,
            dropout: Dropout::new(cfg.dropout),
            channels: cfg.channels,
            num_heads: cfg.num_heads,
            head_channels,
            proximal_bias: cfg.proximal_bias,
            block_length: cfg.block_length,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, L]`
    /// - `attn_mask`: optional `[B, 1, L, L]` (1 = attend, 0 = forbidden)
    ///
    /// Returns `(out [B, C_out, L], weights [B, H, L, L])`.
    pub fn forward(
        &self,
        x: &Tensor,
        attn_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (b, c, l) = x.dims3()?;
        if c != self.channels || l == 0 {
            return Err(Error::shape_desc(
                "attention input",
                format!("[B, {}, L > 0]", self.channels),
                x.dims(),
            ));
        }
        if let Some(m) = attn_mask {
            let (mb, mh, mq, mk) = m.dims4()?;
            if mb != b || mh != 1 || mq != l || mk != l {
                return Err(Error::shape("attention mask", [b, 1, l, l], m.dims()));
            }
        }
        let (h, dh) = (self.num_heads, self.head_channels);
        let scale = (dh as f64).powf(-0.5);

        // [B, C, L] → [B, H, L, Dh]
        let split_heads = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, h, dh, l))?.transpose(2, 3)?.contiguous()
        };
        let q = split_heads(self.conv_q.forward(x)?)?;
        let k = split_heads(self.conv_k.forward(x)?)?;
        let v = split_heads(self.conv_v.forward(x)?)?;

        let mut scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

        if let Some(rel) = &self.relative {
            let rel_k = rel.window_for(&rel.key, l)?; // [H, 2L-1, Dh]
            let rel_logits =
                q.broadcast_matmul(&rel_k.unsqueeze(0)?.t()?.contiguous()?)?; // [B, H, L, 2L-1]
            let abs_logits = relative_to_absolute(&rel_logits)?;
            scores = (scores + (abs_logits * scale)?)?;
        }

        if self.proximal_bias {
            let bias = mask::proximal_bias(l, scores.dtype(), scores.device())?;
            scores = scores.broadcast_add(&bias)?;
        }

        if let Some(valid) = attn_mask {
            scores = mask::masked_fill(&scores, &mask::invert(valid)?, MASK_SENTINEL)?;
        }
        if let Some(radius) = self.block_length {
            let outside = mask::outside_band(l, radius, scores.device())?;
            scores = mask::masked_fill(&scores, &outside, MASK_SENTINEL)?;
        }

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.dropout.forward_t(&weights, train)?;

        let mut out = weights.matmul(&v)?; // [B, H, L, Dh]

        if let Some(rel) = &self.relative {
            let rel_weights = absolute_to_relative(&weights)?; // [B, H, L, 2L-1]
            let rel_v = rel.window_for(&rel.value, l)?.unsqueeze(0)?.contiguous()?;
            out = (out + rel_weights.broadcast_matmul(&rel_v)?)?;
        }

        // [B, H, L, Dh] → [B, H, Dh, L] → [B, C, L]
        let out = out.transpose(2, 3)?.reshape((b, c, l))?;
        let out = self.conv_o.forward(&out)?;
        Ok((out, weights))
    }
}
