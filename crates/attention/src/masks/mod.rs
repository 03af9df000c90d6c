//! Mask utilities shared by attention implementations.
//!
//! All masks are additive tensors with dtype `f32`. Values are either `0.0`
//! (keep) or [`MASKED_VALUE`] (discard) and are added to the scaled logits
//! before the softmax. The discard value is finite, so a query whose keys are
//! all masked gets uniform weights instead of NaN.

pub mod causal;
pub mod padding;

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Result};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Additive value for a discarded position. Several masks summed together
/// stay finite in `f32`.
pub const MASKED_VALUE: f32 = -1e9;

pub use causal::{bias_window, build_bias_mask, validate_bias_mask};
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

/// Broadcasts a caller-supplied additive mask to `target`
/// (`[batch, heads, q_len, k_len]`) in [`MASK_DTYPE`].
///
/// Masks of rank 2 to 4 are accepted; dimensions are aligned from the right
/// and each must be `1` or equal to the target.
pub fn expand_additive_mask(
    context: &'static str,
    mask: &Tensor,
    target: (usize, usize, usize, usize),
) -> Result<Tensor> {
    let target_dims = [target.0, target.1, target.2, target.3];
    let dims = mask.dims();
    if !(2..=4).contains(&dims.len()) {
        return Err(AttentionError::shape(
            context,
            format!("mask must have rank 2 to 4, got {dims:?}"),
        ));
    }
    let offset = target_dims.len() - dims.len();
    for (axis, &dim) in dims.iter().enumerate() {
        let expected = target_dims[offset + axis];
        if dim != 1 && dim != expected {
            return Err(AttentionError::shape(
                context,
                format!("mask {dims:?} does not broadcast to {target_dims:?}"),
            ));
        }
    }
    Ok(mask.to_dtype(MASK_DTYPE)?.broadcast_as(target)?)
}
