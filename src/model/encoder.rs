//! Phoneme encoder: embedding front-end plus a stack of relative-attention
//! transformer blocks.
//!
//! ```text
//! ids [B, P] ─ emb·√C ─ mask ─┬─ block × N ─ mask ─┬─ proj ─ mask ─ (mean, log_scale)
//!                             │                    └─ hidden [B, C, P]
//!                             └─ x_mask [B, 1, P]
//!
//! block:  x ─ mask ─ attn ─ drop ─ (+x) ─ norm1 ─ ffn ─ drop ─ (+) ─ norm2
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! emb.weight                               (n_vocab, C)
//! encoder.attn_layers.{i}.*                see attention module
//! encoder.norm_layers_1.{i}.{weight,bias}
//! encoder.ffn_layers.{i}.conv_1.{weight,bias}
//! encoder.ffn_layers.{i}.conv_2.{weight,bias}
//! encoder.norm_layers_2.{i}.{weight,bias}
//! proj.{weight,bias}                       Conv1d(C, C_stats, 1)
//! ```

use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{Conv1d, Dropout, Embedding, VarBuilder};

use super::attention::{AttentionConfig, RelativePositionAttention};
use super::mask;
use super::norm::ChannelLayerNorm;
use crate::config::{EncoderConfig, StatsMode};
use crate::{Error, Result};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Position-wise feed-forward network: two 1-D convolutions with ReLU.
///
/// Inputs are masked before each convolution so padded positions never feed
/// valid ones through the kernel.
#[derive(Debug, Clone)]
pub struct FeedForward {
    conv_1: Conv1d,
    conv_2: Conv1d,
    /// Left/right zero padding applied before each convolution.
    padding: (usize, usize),
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(
        channels: usize,
        out_channels: usize,
        ffn_channels: usize,
        cfg: &EncoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_cfg = candle_nn::Conv1dConfig::default();
        let k = cfg.kernel_size;
        if k == 0 {
            return Err(Error::Config("encoder.kernel_size must be positive".into()));
        }
        Ok(Self {
            conv_1: candle_nn::conv1d(channels, ffn_channels, k, conv_cfg, vb.pp("conv_1"))?,
            conv_2: candle_nn::conv1d(ffn_channels, out_channels, k, conv_cfg, vb.pp("conv_2"))?,
            padding: cfg.ffn_padding.amounts(k),
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn pad(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self.padding {
            (0, 0) => Ok(x.clone()),
            (left, right) => x.pad_with_zeros(2, left, right),
        }
    }

    /// `x: [B, C, L]`, `x_mask: [B, 1, L]` → `[B, C_out, L]`, masked.
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.pad(&x.broadcast_mul(x_mask)?)?;
        let h = self.conv_1.forward(&h)?.relu()?;
        let h = self.dropout.forward_t(&h, train)?;
        let h = self.pad(&h.broadcast_mul(x_mask)?)?;
        let h = self.conv_2.forward(&h)?;
        Ok(h.broadcast_mul(x_mask)?)
    }
}

/// One transformer block with post-norm residuals.
#[derive(Debug, Clone)]
pub struct EncoderBlock {
    attn: RelativePositionAttention,
    norm_1: ChannelLayerNorm,
    ffn: FeedForward,
    norm_2: ChannelLayerNorm,
    dropout: Dropout,
}

impl EncoderBlock {
    /// Returns `(x [B, C, L], attention weights [B, H, L, L])`.
    pub fn forward(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        attn_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let x = x.broadcast_mul(x_mask)?;
        let (y, weights) = self.attn.forward(&x, Some(attn_mask), train)?;
        let y = self.dropout.forward_t(&y, train)?;
        let x = self.norm_1.forward(&(x + y)?)?;

        let y = self.ffn.forward(&x, x_mask, train)?;
        let y = self.dropout.forward_t(&y, train)?;
        let x = self.norm_2.forward(&(x + y)?)?;
        Ok((x, weights))
    }
}

/// `N` encoder blocks sharing one pairwise attention mask.
#[derive(Debug, Clone)]
pub struct PhonemeEncoderStack {
    blocks: Vec<EncoderBlock>,
    channels: usize,
}

impl PhonemeEncoderStack {
    pub fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.hidden_channels;
        let attn_cfg = AttentionConfig {
            channels: c,
            out_channels: c,
            num_heads: cfg.num_heads,
            window_size: cfg.window_size,
            dropout: cfg.dropout,
            proximal_bias: cfg.proximal_bias,
            block_length: cfg.block_length,
        };

        let mut blocks = Vec::with_capacity(cfg.num_layers);
        for i in 0..cfg.num_layers {
            blocks.push(EncoderBlock {
                attn: RelativePositionAttention::new(&attn_cfg, vb.pp(format!("attn_layers.{i}")))?,
                norm_1: ChannelLayerNorm::new(
                    c,
                    LAYER_NORM_EPS,
                    vb.pp(format!("norm_layers_1.{i}")),
                )?,
                ffn: FeedForward::new(c, c, cfg.ffn_channels, cfg, vb.pp(format!("ffn_layers.{i}")))?,
                norm_2: ChannelLayerNorm::new(
                    c,
                    LAYER_NORM_EPS,
                    vb.pp(format!("norm_layers_2.{i}")),
                )?,
                dropout: Dropout::new(cfg.dropout),
            });
        }
        Ok(Self {
            blocks,
            channels: c,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, L]`
    /// - `x_mask`: `[B, 1, L]` validity mask
    ///
    /// Returns the masked hidden sequence and one `[B, H, L, L]` weight
    /// tensor per block.
    pub fn forward(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let (b, c, l) = x.dims3()?;
        if c != self.channels {
            return Err(Error::shape_desc(
                "encoder stack input",
                format!("[B, {}, L]", self.channels),
                x.dims(),
            ));
        }
        if x_mask.dims() != [b, 1, l] {
            return Err(Error::shape("encoder stack mask", [b, 1, l], x_mask.dims()));
        }

        let attn_mask = mask::pairwise_mask(x_mask)?;
        let mut h = x.clone();
        let mut weights = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, w) = block.forward(&h, x_mask, &attn_mask, train)?;
            h = next;
            weights.push(w);
        }
        Ok((h.broadcast_mul(x_mask)?, weights))
    }
}

/// Output of [`PhonemeEncoder::forward`].
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[B, C, P]`, zero at padded phonemes.
    pub hidden: Tensor,
    /// `[B, C_out, P]`
    pub mean: Tensor,
    /// `[B, C_out, P]`; all zeros for [`StatsMode::MeanOnly`].
    pub log_scale: Tensor,
    /// `[B, 1, P]` validity mask.
    pub mask: Tensor,
    /// One `[B, H, P, P]` tensor per block.
    pub attention_weights: Vec<Tensor>,
}

/// Embedding front-end, encoder stack and statistics projection.
#[derive(Debug, Clone)]
pub struct PhonemeEncoder {
    emb: Embedding,
    stack: PhonemeEncoderStack,
    proj: Conv1d,
    stats: StatsMode,
    hidden_channels: usize,
    out_channels: usize,
}

impl PhonemeEncoder {
    pub fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let c = cfg.hidden_channels;
        let init = candle_nn::Init::Randn {
            mean: 0.0,
            stdev: (c as f64).powf(-0.5),
        };
        let table = vb.pp("emb").get_with_hints((cfg.n_vocab, c), "weight", init)?;
        let proj = candle_nn::conv1d(
            c,
            cfg.stats.projected_channels(cfg.out_channels),
            1,
            candle_nn::Conv1dConfig::default(),
            vb.pp("proj"),
        )?;
        Ok(Self {
            emb: Embedding::new(table, c),
            stack: PhonemeEncoderStack::new(cfg, vb.pp("encoder"))?,
            proj,
            stats: cfg.stats,
            hidden_channels: c,
            out_channels: cfg.out_channels,
        })
    }

    pub fn stack(&self) -> &PhonemeEncoderStack {
        &self.stack
    }

    /// Forward pass.
    ///
    /// - `ids`: `[B, P]` integer phoneme ids
    /// - `lengths`: `[B]` valid length of each row, `<= P`
    pub fn forward(&self, ids: &Tensor, lengths: &Tensor, train: bool) -> Result<EncoderOutput> {
        let (b, p) = ids.dims2()?;
        if p == 0 {
            return Err(Error::shape_desc("phoneme ids", "[B, P > 0]", ids.dims()));
        }
        if lengths.dims() != [b] {
            return Err(Error::shape("phoneme lengths", [b], lengths.dims()));
        }
        let host: Vec<u32> = lengths.to_dtype(DType::U32)?.to_vec1()?;
        if let Some(&bad) = host.iter().find(|&&len| len as usize > p) {
            return Err(Error::InvalidInput(format!(
                "phoneme length {bad} exceeds padded length {p}"
            )));
        }

        let ids = ids.to_dtype(DType::U32)?;
        let x = (self.emb.forward(&ids)? * (self.hidden_channels as f64).sqrt())?;
        let x = x.transpose(1, 2)?.contiguous()?; // [B, C, P]
        let x_mask = mask::sequence_mask(lengths, p, x.dtype())?.unsqueeze(1)?;
        let x = x.broadcast_mul(&x_mask)?;

        let (hidden, attention_weights) = self.stack.forward(&x, &x_mask, train)?;
        let stats = self.proj.forward(&hidden)?.broadcast_mul(&x_mask)?;

        let (mean, log_scale) = match self.stats {
            StatsMode::MeanAndLogScale => (
                stats.narrow(1, 0, self.out_channels)?,
                stats.narrow(1, self.out_channels, self.out_channels)?,
            ),
            StatsMode::MeanOnly => {
                let zeros = stats.zeros_like()?;
                (stats, zeros)
            }
        };
        tracing::debug!(batch = b, phonemes = p, "encoded phonemes");

        Ok(EncoderOutput {
            hidden,
            mean,
            log_scale,
            mask: x_mask,
            attention_weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FfnPadding;
    use candle_core::{Device, IndexOp};
    use candle_nn::VarMap;

    fn small_cfg() -> EncoderConfig {
        EncoderConfig {
            n_vocab: 20,
            hidden_channels: 16,
            out_channels: 16,
            ffn_channels: 32,
            num_heads: 4,
            num_layers: 2,
            dropout: 0.0,
            ..EncoderConfig::default()
        }
    }

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn padded_ids(dev: &Device) -> (Tensor, Tensor) {
        let ids = Tensor::new(&[[3u32, 7, 9, 0, 0], [1, 2, 3, 4, 5]], dev).unwrap();
        let lengths = Tensor::new(&[3u32, 5], dev).unwrap();
        (ids, lengths)
    }

    #[test]
    fn test_encoder_shapes_and_masking() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let enc = PhonemeEncoder::new(&small_cfg(), vb).unwrap();
        let (ids, lengths) = padded_ids(&dev);
        let out = enc.forward(&ids, &lengths, false).unwrap();

        assert_eq!(out.hidden.dims(), &[2, 16, 5]);
        assert_eq!(out.mean.dims(), &[2, 16, 5]);
        assert_eq!(out.log_scale.dims(), &[2, 16, 5]);
        assert_eq!(out.mask.dims(), &[2, 1, 5]);
        assert_eq!(out.attention_weights.len(), 2);
        assert_eq!(out.attention_weights[0].dims(), &[2, 4, 5, 5]);

        for t in [&out.hidden, &out.mean, &out.log_scale] {
            let pad: Vec<f32> = t.i((0, .., 3..)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            assert!(pad.iter().all(|&v| v == 0.0));
            let all: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
            assert!(all.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_padding_tokens_do_not_affect_valid_positions() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let enc = PhonemeEncoder::new(&small_cfg(), vb).unwrap();
        let lengths = Tensor::new(&[3u32], &dev).unwrap();
        let a = Tensor::new(&[[3u32, 7, 9, 0, 0]], &dev).unwrap();
        let b = Tensor::new(&[[3u32, 7, 9, 11, 12]], &dev).unwrap();
        let ha = enc.forward(&a, &lengths, false).unwrap().hidden;
        let hb = enc.forward(&b, &lengths, false).unwrap().hidden;
        let diff: f32 = (ha - hb)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "diff={diff}");
    }

    #[test]
    fn test_causal_ffn_ignores_future() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let cfg = EncoderConfig {
            ffn_padding: FfnPadding::Causal,
            ..small_cfg()
        };
        let ffn = FeedForward::new(16, 16, 32, &cfg, vb).unwrap();
        let mask = Tensor::ones((1, 1, 6), DType::F32, &dev).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 16, 6), &dev).unwrap();
        let last = Tensor::randn(0f32, 1.0, (1, 16, 1), &dev).unwrap();
        let changed = Tensor::cat(&[&x.i((.., .., ..5)).unwrap(), &last], 2).unwrap();

        let ya = ffn.forward(&x, &mask, false).unwrap();
        let yb = ffn.forward(&changed, &mask, false).unwrap();
        let head_a: Vec<f32> = ya.i((.., .., ..5)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let head_b: Vec<f32> = yb.i((.., .., ..5)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in head_a.iter().zip(&head_b) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(ya.dims(), &[1, 16, 6]);
    }

    #[test]
    fn test_mean_only_stats() {
        let dev = Device::Cpu;
        let cfg = EncoderConfig {
            stats: StatsMode::MeanOnly,
            ..small_cfg()
        };
        let enc = PhonemeEncoder::new(&cfg, VarBuilder::zeros(DType::F32, &dev)).unwrap();
        let (ids, lengths) = padded_ids(&dev);
        let out = enc.forward(&ids, &lengths, false).unwrap();
        assert_eq!(out.mean.dims(), &[2, 16, 5]);
        let logs: Vec<f32> = out.log_scale.flatten_all().unwrap().to_vec1().unwrap();
        assert!(logs.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_length_beyond_padding_rejected() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let enc = PhonemeEncoder::new(&small_cfg(), vb).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3]], &dev).unwrap();
        let lengths = Tensor::new(&[4u32], &dev).unwrap();
        assert!(matches!(
            enc.forward(&ids, &lengths, false),
            Err(Error::InvalidInput(_))
        ));
        let lengths = Tensor::new(&[3u32, 3], &dev).unwrap();
        assert!(matches!(
            enc.forward(&ids, &lengths, false),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_kernel_rejected() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let cfg = EncoderConfig {
            kernel_size: 0,
            ..small_cfg()
        };
        assert!(matches!(
            PhonemeEncoder::new(&cfg, vb),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stack_rejects_wrong_mask() {
        let dev = Device::Cpu;
        let (_varmap, vb) = make_vb(&dev);
        let stack = PhonemeEncoderStack::new(&small_cfg(), vb).unwrap();
        assert_eq!(stack.num_layers(), 2);
        let x = Tensor::randn(0f32, 1.0, (2, 16, 4), &dev).unwrap();
        let mask = Tensor::ones((2, 1, 5), DType::F32, &dev).unwrap();
        assert!(stack.forward(&x, &mask, false).is_err());
    }
}
