//! The static causal bias mask and the window of it used per forward call.
//!
//! The bias mask has dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[1, 1, max_len, max_len]`. Entries are `0.0` on and below the diagonal and
//! [`MASKED_VALUE`](super::MASKED_VALUE) above it.

use candle_core::{Device, Tensor};

use super::MASKED_VALUE;
use crate::core::{AttentionError, Result};

/// Build the causal bias mask for sequences of up to `max_len` positions.
pub fn build_bias_mask(max_len: usize, device: &Device) -> Result<Tensor> {
    if max_len == 0 {
        return Err(AttentionError::Configuration(
            "bias mask length must be greater than zero".to_string(),
        ));
    }
    let mut data = vec![0f32; max_len * max_len];
    for q in 0..max_len {
        for k in (q + 1)..max_len {
            data[q * max_len + k] = MASKED_VALUE;
        }
    }
    Ok(Tensor::from_vec(data, (1, 1, max_len, max_len), device)?)
}

/// Checks that `mask` is a `[1, 1, L, L]` bias mask and returns `L`.
pub fn validate_bias_mask(mask: &Tensor) -> Result<usize> {
    match mask.dims() {
        [1, 1, rows, cols] if rows == cols && *rows > 0 => Ok(*rows),
        dims => Err(AttentionError::Configuration(format!(
            "bias mask must have shape [1, 1, max_len, max_len], got {dims:?}"
        ))),
    }
}

/// Slice of the bias mask that applies to `q_len` queries over `k_len` keys.
///
/// Queries are aligned with the most recent keys, so rows
/// `k_len - q_len .. k_len` are taken. With `q_len == k_len` this is the
/// top-left `[q_len, k_len]` block; a single decoding step gets the last row.
pub fn bias_window(mask: &Tensor, q_len: usize, k_len: usize) -> Result<Tensor> {
    let max_len = validate_bias_mask(mask)?;
    if k_len > max_len {
        return Err(AttentionError::shape(
            "attention.bias_mask",
            format!("{k_len} keys exceed the bias mask length {max_len}"),
        ));
    }
    if q_len > k_len {
        return Err(AttentionError::shape(
            "attention.bias_mask",
            format!("{q_len} queries cannot be aligned with only {k_len} keys"),
        ));
    }
    let offset = k_len - q_len;
    Ok(mask.narrow(2, offset, q_len)?.narrow(3, 0, k_len)?)
}
