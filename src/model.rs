//! Model components for phoneme-to-frame alignment.
//!
//! ## Components
//!
//! - [`attention`]: relative-position multi-head self-attention
//! - [`encoder`]: phoneme embedding + transformer stack + statistics head
//! - [`aligner`]: duration → frame boundary arithmetic
//! - [`upsampler`]: learnable soft upsampler from phonemes to frames
//!
//! [`AlignmentCore`] bundles the encoder and the upsampler behind the two
//! entry points used by callers.
//!
//! ## Weight key paths
//!
//! ```text
//! text_encoder.*     encoder module
//! upsampler.*        upsampler module
//! ```

pub mod aligner;
pub mod attention;
pub mod encoder;
pub mod mask;
pub mod norm;
pub mod upsampler;

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::ModelConfig;
use crate::{Error, Result};

pub use encoder::{EncoderOutput, PhonemeEncoder};
pub use upsampler::{LearnableUpsampler, UpsamplerOutput};

/// Phoneme encoder and learnable upsampler sharing one configuration.
#[derive(Debug, Clone)]
pub struct AlignmentCore {
    encoder: PhonemeEncoder,
    upsampler: LearnableUpsampler,
    config: ModelConfig,
}

impl AlignmentCore {
    /// Build from a `VarBuilder`, either a fresh `VarMap` or preloaded weights.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            encoder: PhonemeEncoder::new(&config.encoder, vb.pp("text_encoder"))?,
            upsampler: LearnableUpsampler::new(&config.upsampler, vb.pp("upsampler"))?,
            config: config.clone(),
        })
    }

    /// Load weights from memory-mapped safetensors files.
    pub fn from_safetensors<P: AsRef<Path>>(
        paths: &[P],
        config: &ModelConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let paths: Vec<&Path> = paths.iter().map(|p| p.as_ref()).collect();
        tracing::info!("Loading alignment weights from {:?}", paths);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&paths, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("alignment weights: {e}")))?
        };
        Self::new(config, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("alignment model init: {e}")),
            other => other,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &PhonemeEncoder {
        &self.encoder
    }

    pub fn upsampler(&self) -> &LearnableUpsampler {
        &self.upsampler
    }

    /// Encode padded phoneme ids `[B, P]` with lengths `[B]`.
    pub fn encode_phonemes(
        &self,
        ids: &Tensor,
        lengths: &Tensor,
        train: bool,
    ) -> Result<EncoderOutput> {
        self.encoder.forward(ids, lengths, train)
    }

    /// Expand encoder output `[B, C, P]` to frames using `durations: [B, P]`.
    pub fn upsample(
        &self,
        hidden: &Tensor,
        x_mask: &Tensor,
        durations: &Tensor,
        lengths: &Tensor,
        train: bool,
    ) -> Result<UpsamplerOutput> {
        self.upsampler
            .forward(hidden, x_mask, durations, lengths, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, UpsamplerConfig};
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn small_config() -> ModelConfig {
        ModelConfig {
            encoder: EncoderConfig {
                n_vocab: 32,
                hidden_channels: 16,
                out_channels: 16,
                ffn_channels: 32,
                num_heads: 4,
                num_layers: 2,
                window_size: Some(4),
                dropout: 0.0,
                ..EncoderConfig::default()
            },
            upsampler: UpsamplerConfig {
                hidden_channels: 16,
                dropout: 0.0,
                ..UpsamplerConfig::default()
            },
        }
    }

    #[test]
    fn test_end_to_end() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let core = AlignmentCore::new(&small_config(), vb).unwrap();

        let ids = Tensor::new(&[[4u32, 9, 2, 0, 0], [1, 5, 7, 3, 8]], &dev).unwrap();
        let lengths = Tensor::new(&[3u32, 5], &dev).unwrap();
        let enc = core.encode_phonemes(&ids, &lengths, false).unwrap();
        assert_eq!(enc.hidden.dims(), &[2, 16, 5]);
        assert_eq!(enc.attention_weights.len(), 2);
        let pad: Vec<f32> = enc
            .hidden
            .i((0, .., 3..))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(pad.iter().all(|&v| v == 0.0));

        let durations =
            Tensor::new(&[[2f32, 2., 2., 0., 0.], [1., 1., 1., 1., 1.]], &dev).unwrap();
        let up = core
            .upsample(&enc.hidden, &enc.mask, &durations, &lengths, false)
            .unwrap();
        let lens: Vec<u32> = up.frame_lengths.to_vec1().unwrap();
        assert_eq!(lens, vec![6, 5]);
        assert_eq!(up.frame_hidden.dims(), &[2, 32, 6]);

        let tail: Vec<f32> = up
            .frame_hidden
            .i((1, .., 5))
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(tail.iter().all(|&v| v == 0.0));
        let all: Vec<f32> = up.frame_hidden.flatten_all().unwrap().to_vec1().unwrap();
        assert!(all.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = small_config();
        cfg.upsampler.hidden_channels = 8;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            AlignmentCore::new(&cfg, vb),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = small_config();
        let core = AlignmentCore::new(&cfg, vb).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        varmap.save(&path).unwrap();
        let loaded = AlignmentCore::from_safetensors(&[&path], &cfg, DType::F32, &dev).unwrap();

        let ids = Tensor::new(&[[4u32, 9, 2]], &dev).unwrap();
        let lengths = Tensor::new(&[3u32], &dev).unwrap();
        let a = core.encode_phonemes(&ids, &lengths, false).unwrap().mean;
        let b = loaded.encode_phonemes(&ids, &lengths, false).unwrap().mean;
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_missing_weights_file() {
        let cfg = small_config();
        let res = AlignmentCore::from_safetensors(
            &["/nonexistent/model.safetensors"],
            &cfg,
            DType::F32,
            &Device::Cpu,
        );
        assert!(matches!(res, Err(Error::WeightLoad(_))));
    }
}
