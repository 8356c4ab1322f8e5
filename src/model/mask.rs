//! Sequence masks and select-based masking helpers.
//!
//! Masks come in two flavours:
//! - validity masks in the model dtype (1.0 = valid, 0.0 = padding), used
//!   multiplicatively on activations;
//! - `u8` "forbidden" masks (1 = masked), used with [`masked_fill`] to select
//!   a replacement value without touching the source tensor.

use candle_core::{DType, Device, Result, Tensor};

/// Finite score given to masked attention / alignment logits.
///
/// Softmax over a row made only of sentinels is uniform instead of NaN, and a
/// sentinel next to any real logit underflows to exactly zero weight in f32.
pub const MASK_SENTINEL: f64 = -1e4;

/// Validity mask `[B, max_len]` from `lengths: [B]` (any numeric dtype).
///
/// `mask[b, t] = 1.0` iff `t < lengths[b]`.
pub fn sequence_mask(lengths: &Tensor, max_len: usize, dtype: DType) -> Result<Tensor> {
    let device = lengths.device();
    let range = Tensor::arange(0u32, max_len as u32, device)?
        .to_dtype(DType::F32)?
        .unsqueeze(0)?; // [1, T]
    let lengths = lengths.to_dtype(DType::F32)?.unsqueeze(1)?; // [B, 1]
    range.broadcast_lt(&lengths)?.to_dtype(dtype)
}

/// Pairwise attention mask `[B, 1, L, L]` from a validity mask `[B, 1, L]`.
pub fn pairwise_mask(x_mask: &Tensor) -> Result<Tensor> {
    let rows = x_mask.unsqueeze(3)?; // [B, 1, L, 1]
    let cols = x_mask.unsqueeze(2)?; // [B, 1, 1, L]
    rows.broadcast_mul(&cols)
}

/// Replace `xs` with `value` wherever `mask` (u8, broadcastable to `xs`) is non-zero.
pub fn masked_fill(xs: &Tensor, mask: &Tensor, value: f64) -> Result<Tensor> {
    let shape = xs.shape();
    let mask = mask.broadcast_as(shape)?;
    let fill = Tensor::new(value, xs.device())?
        .to_dtype(xs.dtype())?
        .broadcast_as(shape)?;
    mask.where_cond(&fill, xs)
}

/// `u8` mask that is 1 where a validity mask is 0.
pub fn invert(valid: &Tensor) -> Result<Tensor> {
    valid.eq(0.0)
}

/// Band mask `[1, 1, L, L]`, 1 where `|i - j| > radius`.
pub fn outside_band(len: usize, radius: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..len)
        .flat_map(|i| (0..len).map(move |j| u8::from(i.abs_diff(j) > radius)))
        .collect();
    Tensor::from_vec(data, (1, 1, len, len), device)
}

/// Proximity bias `[1, 1, L, L]` with entries `-ln(1 + |i - j|)`.
pub fn proximal_bias(len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| -(i.abs_diff(j) as f32).ln_1p()))
        .collect();
    Tensor::from_vec(data, (1, 1, len, len), device)?.to_dtype(dtype)
}
