//! Phoneme-to-frame alignment core for non-autoregressive TTS in pure Rust.
//!
//! A candle-based implementation of the two numerical pieces that sit between
//! a phoneme sequence and a frame-level acoustic decoder:
//!
//! ```text
//! phoneme ids → Embedding → N × (RelPos MHA + conv FFN) ──→ hidden [B, C, P]
//!                                                     └──→ mean / log_scale
//!                                    ↓
//!            durations [B, P] → DurationAligner (S, E boundary matrices)
//!                                    ↓
//!            LearnableUpsampler (soft alignment W, C) → frame hidden [B, C', F]
//! ```
//!
//! No forced aligner and no autoregressive attention: the phoneme-to-frame
//! alignment is derived from cumulative durations plus a small learned MLP,
//! so the whole path stays differentiable w.r.t. the predicted durations.
//!
//! ## Modules
//!
//! - [`config`]: serde configs for the encoder and upsampler
//! - [`model`]: relative attention, encoder stack, aligner, upsampler
//! - [`text`]: phoneme symbol inventory and id mapping

pub mod config;
pub mod model;
pub mod text;

mod error;

pub use error::{Error, Result};
pub use model::{AlignmentCore, EncoderOutput, UpsamplerOutput};
