//! Boundary arithmetic between soft phoneme durations and output frames.
//!
//! For frame `f` (1-based time `t = f + 1`) and phoneme `p` with cumulative
//! duration `cum[p]` and start `cum[p] - d[p]`:
//!
//! ```text
//! S[f, p] = t - start[p]     how far the frame is past the phoneme start
//! E[f, p] = cum[p] - t       how far the phoneme end is past the frame
//! ```
//!
//! Both are zeroed wherever the frame or the phoneme is padding. Durations of
//! padded phonemes are selected away before the cumulative sum, whatever
//! their value.

use candle_core::{DType, Tensor};

use super::mask;
use crate::{Error, Result};

/// Result of [`DurationAligner::align`].
#[derive(Debug, Clone)]
pub struct Alignment {
    /// `[B]` u32 frame count per item.
    pub frame_lengths: Tensor,
    /// Host copy of `frame_lengths`.
    pub frame_lengths_host: Vec<usize>,
    /// `S`: `[B, F, P]`, zero where masked.
    pub start: Tensor,
    /// `E`: `[B, F, P]`, zero where masked.
    pub end: Tensor,
    /// `[B, F, P]` u8, 1 where the frame or the phoneme is invalid.
    pub invalid: Tensor,
    /// `[B, F]` validity mask in the duration dtype.
    pub frame_mask: Tensor,
    /// Padded frame axis `F`.
    pub num_frames: usize,
}

/// Turns per-phoneme durations into frame lengths and boundary matrices.
#[derive(Debug, Clone, Copy)]
pub struct DurationAligner {
    max_frame_length: usize,
}

impl DurationAligner {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// - `durations`: `[B, P]` non-negative, possibly fractional
    /// - `phoneme_mask`: `[B, P]` validity mask (1 = real phoneme)
    pub fn align(&self, durations: &Tensor, phoneme_mask: &Tensor) -> Result<Alignment> {
        let (b, p) = durations.dims2()?;
        if p == 0 {
            return Err(Error::shape_desc("durations", "[B, P > 0]", durations.dims()));
        }
        if phoneme_mask.dims() != [b, p] {
            return Err(Error::shape("phoneme mask", [b, p], phoneme_mask.dims()));
        }
        let dtype = durations.dtype();
        let device = durations.device();

        let phoneme_mask = phoneme_mask.to_dtype(dtype)?;
        let d = mask::masked_fill(durations, &mask::invert(&phoneme_mask)?, 0.0)?;
        let values: Vec<f32> = d.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(Error::InvalidInput(format!(
                "durations must be finite and non-negative, got {bad}"
            )));
        }

        let cum = d.cumsum(1)?;
        let start = (&cum - &d)?;

        let totals: Vec<f32> = cum
            .narrow(1, p - 1, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec1()?;
        let frame_lengths_host: Vec<usize> = totals
            .iter()
            .enumerate()
            .map(|(item, &total)| {
                let frames = total.round_ties_even().max(0.0) as usize;
                if frames > self.max_frame_length {
                    tracing::warn!(
                        item,
                        frames,
                        cap = self.max_frame_length,
                        "frame length truncated"
                    );
                }
                frames.min(self.max_frame_length)
            })
            .collect();
        let num_frames = frame_lengths_host.iter().copied().max().unwrap_or(0).max(1);

        let frame_lengths = Tensor::from_vec(
            frame_lengths_host.iter().map(|&n| n as u32).collect::<Vec<_>>(),
            b,
            device,
        )?;
        let frame_mask = mask::sequence_mask(&frame_lengths, num_frames, dtype)?;

        let valid = frame_mask
            .unsqueeze(2)?
            .broadcast_mul(&phoneme_mask.unsqueeze(1)?)?; // [B, F, P]
        let invalid = mask::invert(&valid)?;

        let t = Tensor::arange(1u32, num_frames as u32 + 1, device)?
            .to_dtype(dtype)?
            .reshape((1, num_frames, 1))?;
        let end = cum.unsqueeze(1)?.broadcast_sub(&t)?;
        let start = t.broadcast_sub(&start.unsqueeze(1)?)?;
        let end = mask::masked_fill(&end, &invalid, 0.0)?;
        let start = mask::masked_fill(&start, &invalid, 0.0)?;

        tracing::debug!(batch = b, phonemes = p, frames = num_frames, "aligned durations");

        Ok(Alignment {
            frame_lengths,
            frame_lengths_host,
            start,
            end,
            invalid,
            frame_mask,
            num_frames,
        })
    }
}
