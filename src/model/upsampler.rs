//! Learnable duration upsampler.
//!
//! Expands a phoneme sequence `[B, C, P]` into frames `[B, C_out, F]` using
//! soft durations. Every frame gets `Q` softmax distributions over phonemes
//! (`W`) computed from per-phoneme features and the boundary offsets `S`, `E`,
//! plus a small per-(frame, phoneme) recombination tensor `C`:
//!
//! ```text
//! hidden ─ proj ─ conv block ─┬─ ⊕ S,E ─ mlp_q ─ softmax_P ─ W [B, Q, F, P]
//!                             └─ ⊕ S,E ─ mlp_p ─────────────  C [B, F, P, P_OUT]
//!
//! out = proj_o( proj_h(W·hidden) + proj_c(W·C) )
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! proj.{weight,bias}                Linear(C, C)
//! conv.conv_1.{weight,bias}         Conv1d(C, Q_IN, k)
//! conv.norm.{weight,bias}           LayerNorm(Q_IN)
//! recombination.{proj,conv}.*       second feature block (separate paths only)
//! mlp_q.{mlp_1,norm,mlp_2}.*        Q_IN+2 → Q → Q
//! mlp_p.{mlp_1,norm,mlp_2}.*        Q_IN+2 → P_OUT → P_OUT
//! proj_h.{weight,bias}              Linear(Q·C, C)
//! proj_c.{weight,bias}              Linear(Q·P_OUT, C)
//! proj_o.{weight,bias}              Linear(C, C_out)
//! ```

use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{Conv1d, Dropout, LayerNorm, Linear, VarBuilder};

use super::aligner::{Alignment, DurationAligner};
use super::mask::{self, MASK_SENTINEL};
use super::norm::ChannelLayerNorm;
use crate::config::{FeaturePaths, FfnPadding, UpsamplerConfig};
use crate::{Error, Result};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Per-phoneme feature block: linear projection, then masked
/// conv → LayerNorm → SiLU → dropout.
#[derive(Debug, Clone)]
struct PhonemeFeatures {
    proj: Linear,
    conv: Conv1d,
    norm: ChannelLayerNorm,
    padding: (usize, usize),
    dropout: Dropout,
}

impl PhonemeFeatures {
    fn new(cfg: &UpsamplerConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.kernel_size == 0 {
            return Err(Error::Config("upsampler.kernel_size must be positive".into()));
        }
        let c = cfg.hidden_channels;
        let conv_vb = vb.pp("conv");
        Ok(Self {
            proj: candle_nn::linear(c, c, vb.pp("proj"))?,
            conv: candle_nn::conv1d(
                c,
                cfg.feature_channels,
                cfg.kernel_size,
                candle_nn::Conv1dConfig::default(),
                conv_vb.pp("conv_1"),
            )?,
            norm: ChannelLayerNorm::new(cfg.feature_channels, LAYER_NORM_EPS, conv_vb.pp("norm"))?,
            padding: FfnPadding::Same.amounts(cfg.kernel_size),
            dropout: Dropout::new(cfg.dropout),
        })
    }

    /// `x: [B, P, C]`, `phone_mask: [B, P]` → `[B, P, Q_IN]`, zero at padding.
    fn forward(&self, x: &Tensor, phone_mask: &Tensor, train: bool) -> Result<Tensor> {
        let mask = phone_mask.unsqueeze(1)?; // [B, 1, P]
        let h = self.proj.forward(x)?.transpose(1, 2)?.contiguous()?; // [B, C, P]
        let h = h.broadcast_mul(&mask)?;
        let h = match self.padding {
            (0, 0) => h,
            (left, right) => h.pad_with_zeros(2, left, right)?,
        };
        let h = self.conv.forward(&h)?;
        let h = self.norm.forward(&h)?.silu()?;
        let h = self.dropout.forward_t(&h, train)?;
        let h = h.broadcast_mul(&mask)?;
        Ok(h.transpose(1, 2)?.contiguous()?)
    }
}

/// Linear → LayerNorm → SiLU → dropout → Linear over the last axis.
#[derive(Debug, Clone)]
struct AlignmentMlp {
    mlp_1: Linear,
    norm: LayerNorm,
    mlp_2: Linear,
    dropout: Dropout,
}

impl AlignmentMlp {
    fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            mlp_1: candle_nn::linear(in_dim, hidden_dim, vb.pp("mlp_1"))?,
            norm: candle_nn::layer_norm(hidden_dim, LAYER_NORM_EPS, vb.pp("norm"))?,
            mlp_2: candle_nn::linear(hidden_dim, out_dim, vb.pp("mlp_2"))?,
            dropout: Dropout::new(dropout),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.mlp_1.forward(xs)?;
        let h = self.norm.forward(&h)?.silu()?;
        let h = self.dropout.forward_t(&h, train)?;
        Ok(self.mlp_2.forward(&h)?)
    }
}

/// Output of [`LearnableUpsampler::forward`].
#[derive(Debug, Clone)]
pub struct UpsamplerOutput {
    /// `[B, C_out, F]`, exactly zero on padded frames.
    pub frame_hidden: Tensor,
    /// `[B, F]` validity mask.
    pub frame_mask: Tensor,
    /// `[B]` u32 frame counts.
    pub frame_lengths: Tensor,
    /// `W`: `[B, Q, F, P]`.
    pub alignment_weights: Tensor,
}

#[derive(Debug, Clone)]
pub struct LearnableUpsampler {
    aligner: DurationAligner,
    features: PhonemeFeatures,
    /// Present only for [`FeaturePaths::Separate`].
    recombination_features: Option<PhonemeFeatures>,
    mlp_q: AlignmentMlp,
    mlp_p: AlignmentMlp,
    proj_h: Linear,
    proj_c: Linear,
    proj_o: Linear,
    hidden_channels: usize,
}

impl LearnableUpsampler {
    pub fn new(cfg: &UpsamplerConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.hidden_channels;
        let mlp_in = cfg.feature_channels + 2;
        let recombination_features = match cfg.feature_paths {
            FeaturePaths::Shared => None,
            FeaturePaths::Separate => Some(PhonemeFeatures::new(cfg, vb.pp("recombination"))?),
        };
        Ok(Self {
            aligner: DurationAligner::new(cfg.max_frame_length),
            features: PhonemeFeatures::new(cfg, vb.clone())?,
            recombination_features,
            mlp_q: AlignmentMlp::new(mlp_in, cfg.q_out, cfg.q_out, cfg.dropout, vb.pp("mlp_q"))?,
            mlp_p: AlignmentMlp::new(mlp_in, cfg.p_out, cfg.p_out, cfg.dropout, vb.pp("mlp_p"))?,
            proj_h: candle_nn::linear(cfg.q_out * c, c, vb.pp("proj_h"))?,
            proj_c: candle_nn::linear(cfg.q_out * cfg.p_out, c, vb.pp("proj_c"))?,
            proj_o: candle_nn::linear(c, cfg.output_channels(), vb.pp("proj_o"))?,
            hidden_channels: c,
        })
    }

    pub fn aligner(&self) -> &DurationAligner {
        &self.aligner
    }

    /// Broadcast `[B, P, Q_IN]` features over frames and append `S`, `E`.
    fn frame_features(&self, features: &Tensor, alignment: &Alignment) -> Result<Tensor> {
        let (b, p, q_in) = features.dims3()?;
        let f = alignment.num_frames;
        let features = features
            .unsqueeze(1)?
            .broadcast_as((b, f, p, q_in))?
            .contiguous()?;
        let boundaries = Tensor::stack(&[&alignment.start, &alignment.end], 3)?;
        Ok(Tensor::cat(&[&features, &boundaries], 3)?)
    }

    /// Forward pass.
    ///
    /// - `hidden`: `[B, C, P]` phoneme hidden states
    /// - `x_mask`: `[B, 1, P]` phoneme validity mask
    /// - `durations`: `[B, P]` soft durations in frames
    /// - `lengths`: `[B]` phoneme lengths
    pub fn forward(
        &self,
        hidden: &Tensor,
        x_mask: &Tensor,
        durations: &Tensor,
        lengths: &Tensor,
        train: bool,
    ) -> Result<UpsamplerOutput> {
        let (b, c, p) = hidden.dims3()?;
        if c != self.hidden_channels {
            return Err(Error::shape_desc(
                "upsampler hidden",
                format!("[B, {}, P]", self.hidden_channels),
                hidden.dims(),
            ));
        }
        if x_mask.dims() != [b, 1, p] {
            return Err(Error::shape("upsampler mask", [b, 1, p], x_mask.dims()));
        }
        if durations.dims() != [b, p] {
            return Err(Error::shape("durations", [b, p], durations.dims()));
        }
        if lengths.dims() != [b] {
            return Err(Error::shape("phoneme lengths", [b], lengths.dims()));
        }
        let dtype = hidden.dtype();

        let phone_mask = x_mask
            .squeeze(1)?
            .to_dtype(dtype)?
            .mul(&mask::sequence_mask(lengths, p, dtype)?)?; // [B, P]
        let alignment = self.aligner.align(&durations.to_dtype(dtype)?, &phone_mask)?;
        let f = alignment.num_frames;

        let x = hidden.transpose(1, 2)?.contiguous()?; // [B, P, C]
        let h_w = self.features.forward(&x, &phone_mask, train)?;
        let h_c = match &self.recombination_features {
            Some(block) => block.forward(&x, &phone_mask, train)?,
            None => h_w.clone(),
        };

        // W: softmax over phonemes, padded phonemes excluded, padded frames zeroed.
        let raw_w = self.mlp_q.forward(&self.frame_features(&h_w, &alignment)?, train)?; // [B, F, P, Q]
        let phone_invalid = mask::invert(&phone_mask)?.reshape((b, 1, p, 1))?;
        let raw_w = mask::masked_fill(&raw_w, &phone_invalid, MASK_SENTINEL)?;
        let w = candle_nn::ops::softmax(&raw_w, 2)?;
        let frame_invalid = mask::invert(&alignment.frame_mask)?.reshape((b, f, 1, 1))?;
        let w = mask::masked_fill(&w, &frame_invalid, 0.0)?;
        let w = w.permute((0, 3, 1, 2))?.contiguous()?; // [B, Q, F, P]
        let q = w.dim(1)?;

        let c_w = self.mlp_p.forward(&self.frame_features(&h_c, &alignment)?, train)?; // [B, F, P, K]

        // Σ_p W[b,q,f,p]·x[b,p,c] → [B, F, Q·C]
        let wh = w
            .broadcast_matmul(&x.unsqueeze(1)?)? // [B, Q, F, C]
            .permute((0, 2, 1, 3))?
            .reshape((b, f, q * c))?;
        let wh = self.proj_h.forward(&wh)?;

        // Σ_p W[b,q,f,p]·C[b,f,p,k] → [B, F, Q·K]
        let wc = w.permute((0, 2, 1, 3))?.contiguous()?.matmul(&c_w)?; // [B, F, Q, K]
        let k = wc.dim(3)?;
        let wc = self.proj_c.forward(&wc.reshape((b, f, q * k))?)?;

        let frame_mask = alignment.frame_mask.unsqueeze(2)?; // [B, F, 1]
        let out = (wh + wc)?.broadcast_mul(&frame_mask)?;
        let out = self.proj_o.forward(&out)?.broadcast_mul(&frame_mask)?;
        let frame_hidden = out.transpose(1, 2)?.contiguous()?; // [B, C_out, F]

        tracing::debug!(
            batch = b,
            phonemes = p,
            frames = f,
            "upsampled phoneme sequence"
        );

        Ok(UpsamplerOutput {
            frame_hidden,
            frame_mask: alignment.frame_mask,
            frame_lengths: alignment.frame_lengths,
            alignment_weights: w,
        })
    }
}

impl UpsamplerOutput {
    /// Row sums of `W` over phonemes, `[B, Q, F]`.
    pub fn alignment_row_sums(&self) -> Result<Tensor> {
        Ok(self.alignment_weights.to_dtype(DType::F32)?.sum(3)?)
    }
}
