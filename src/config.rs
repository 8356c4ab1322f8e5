//! Configuration for the phoneme encoder and the learnable upsampler.
//!
//! Defaults follow the VITS-style phoneme encoder (192 channels, 2 heads,
//! 6 layers, relative window 4) and the Parallel-Tacotron-2 style upsampler
//! (8 feature channels, `Q = 4`, `P = 2`, 1000-frame cap).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Padding strategy of the position-wise feed-forward convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfnPadding {
    /// `(k - 1) / 2` on the left, `k / 2` on the right.
    Same,
    /// `k - 1` on the left only, so position `t` never sees `t + 1..`.
    Causal,
}

impl FfnPadding {
    /// Left/right zero-padding for a convolution of width `kernel_size`.
    pub fn amounts(self, kernel_size: usize) -> (usize, usize) {
        let reach = kernel_size.saturating_sub(1);
        match self {
            FfnPadding::Same => (reach / 2, kernel_size / 2),
            FfnPadding::Causal => (reach, 0),
        }
    }
}

/// Which statistics a projection head emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsMode {
    /// Only a mean; the log-scale is implicitly zero.
    MeanOnly,
    /// Mean and log-scale, stacked along channels.
    MeanAndLogScale,
}

impl StatsMode {
    /// Number of output channels for a statistic of width `channels`.
    pub fn projected_channels(self, channels: usize) -> usize {
        match self {
            StatsMode::MeanOnly => channels,
            StatsMode::MeanAndLogScale => 2 * channels,
        }
    }
}

/// Whether the alignment (`W`) and recombination (`C`) paths share their
/// per-phoneme feature block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeaturePaths {
    Shared,
    Separate,
}

/// Phoneme encoder: embedding + relative-attention transformer + stats head.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Vocabulary size of the phoneme embedding.
    pub n_vocab: usize,
    /// Hidden width `C` of every block.
    pub hidden_channels: usize,
    /// Width of the mean / log-scale statistics.
    pub out_channels: usize,
    /// Inner width of the feed-forward convolutions.
    pub ffn_channels: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    /// Feed-forward convolution kernel size.
    pub kernel_size: usize,
    /// Dropout rate (applied in training only).
    pub dropout: f32,
    /// Relative window radius `W`; `None` disables relative embeddings.
    pub window_size: Option<usize>,
    /// Add `-ln(1 + |i - j|)` to the attention scores.
    pub proximal_bias: bool,
    /// Restrict attention to `|i - j| <= block_length`.
    pub block_length: Option<usize>,
    pub ffn_padding: FfnPadding,
    pub stats: StatsMode,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            n_vocab: crate::text::symbols().len(),
            hidden_channels: 192,
            out_channels: 192,
            ffn_channels: 768,
            num_heads: 2,
            num_layers: 6,
            kernel_size: 3,
            dropout: 0.1,
            window_size: Some(4),
            proximal_bias: false,
            block_length: None,
            ffn_padding: FfnPadding::Same,
            stats: StatsMode::MeanAndLogScale,
        }
    }
}

impl EncoderConfig {
    /// Channels per attention head.
    pub fn head_channels(&self) -> usize {
        self.hidden_channels / self.num_heads
    }
}

/// Learnable duration upsampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsamplerConfig {
    /// Width `C` of the incoming phoneme hidden states.
    pub hidden_channels: usize,
    /// Kernel size of the per-phoneme feature convolution.
    pub kernel_size: usize,
    /// Width `Q_IN` of the per-phoneme alignment features.
    pub feature_channels: usize,
    /// Number of alignment views `Q`.
    pub q_out: usize,
    /// Width `P_OUT` of the recombination weights.
    pub p_out: usize,
    /// Dropout rate (applied in training only).
    pub dropout: f32,
    /// Hard cap on the number of output frames per item.
    pub max_frame_length: usize,
    pub feature_paths: FeaturePaths,
    pub output: StatsMode,
}

impl Default for UpsamplerConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 192,
            kernel_size: 3,
            feature_channels: 8,
            q_out: 4,
            p_out: 2,
            dropout: 0.1,
            max_frame_length: 1000,
            feature_paths: FeaturePaths::Shared,
            output: StatsMode::MeanAndLogScale,
        }
    }
}

impl UpsamplerConfig {
    /// Width of the frame-level output.
    pub fn output_channels(&self) -> usize {
        self.output.projected_channels(self.hidden_channels)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub encoder: EncoderConfig,
    pub upsampler: UpsamplerConfig,
}

impl ModelConfig {
    /// Read and validate a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let enc = &self.encoder;
        let up = &self.upsampler;

        if enc.n_vocab == 0 {
            return Err(Error::Config("encoder.n_vocab must be positive".into()));
        }
        if enc.num_heads == 0 || enc.hidden_channels % enc.num_heads != 0 {
            return Err(Error::Config(format!(
                "encoder.hidden_channels ({}) must be divisible by encoder.num_heads ({})",
                enc.hidden_channels, enc.num_heads
            )));
        }
        if enc.num_layers == 0 {
            return Err(Error::Config("encoder.num_layers must be positive".into()));
        }
        for (name, k) in [
            ("encoder.kernel_size", enc.kernel_size),
            ("upsampler.kernel_size", up.kernel_size),
        ] {
            if k == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if up.hidden_channels != enc.hidden_channels {
            return Err(Error::Config(format!(
                "upsampler.hidden_channels ({}) must match encoder.hidden_channels ({})",
                up.hidden_channels, enc.hidden_channels
            )));
        }
        if up.feature_channels == 0 || up.q_out == 0 || up.p_out == 0 {
            return Err(Error::Config(
                "upsampler.feature_channels, q_out and p_out must be positive".into(),
            ));
        }
        if up.max_frame_length == 0 {
            return Err(Error::Config(
                "upsampler.max_frame_length must be positive".into(),
            ));
        }
        for (name, p) in [("encoder.dropout", enc.dropout), ("upsampler.dropout", up.dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}
