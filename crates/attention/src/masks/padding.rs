//! Builders for padding masks used to drop padded keys.
//!
//! Padding masks are shaped `[batch, 1, 1, k_len]` so they broadcast over heads
//! and queries when added to attention logits.

use candle_core::{Device, Tensor};

use super::{MASKED_VALUE, MASK_DTYPE};
use crate::core::{AttentionError, Result};

/// Construct padding masks from per-batch valid key lengths.
///
/// Lengths larger than `k_len` are clamped.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0f32; batch * k_len];
    for (b, &valid) in key_lengths.iter().enumerate() {
        let row = &mut data[b * k_len..(b + 1) * k_len];
        for value in row.iter_mut().skip(valid.min(k_len)) {
            *value = MASKED_VALUE;
        }
    }
    Ok(Tensor::from_vec(data, (batch, 1, 1, k_len), device)?)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = padding.iter().find(|row| row.len() != k_len) {
        return Err(AttentionError::shape(
            "masks.padding",
            format!(
                "all padding rows must share k_len {k_len}, found one of length {}",
                row.len()
            ),
        ));
    }
    let data: Vec<f32> = padding
        .iter()
        .flatten()
        .map(|&is_padding| if is_padding { MASKED_VALUE } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(data, (padding.len(), 1, 1, k_len), device)?;
    Ok(mask.to_dtype(MASK_DTYPE)?)
}
