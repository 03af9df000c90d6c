//! Lightweight validation helpers shared across layer components.
//!
//! Each helper takes a static `context` label naming the tensor being checked
//! so that errors point at the offending call site, and returns
//! [`LayerError::ShapeContract`] instead of panicking.

use candle_core::{DType, Tensor};

use crate::{LayerError, Result};

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(context: &'static str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(LayerError::shape(
            context,
            format!("expected rank {rank}, got shape {dims:?}"),
        ))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &'static str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(LayerError::shape(
            context,
            format!("expected shape {expected:?}, got {actual:?}"),
        ))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(context: &'static str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden && *batch > 0 && *seq > 0 => Ok(()),
        dims => Err(LayerError::shape(
            context,
            format!("expected (batch, seq, {hidden}) layout with non-empty batch/seq, got {dims:?}"),
        )),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &'static str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(LayerError::shape(
            context,
            format!("expected dtype in {allowed:?}, got {dtype:?}"),
        ))
    }
}

/// Checks that `value` is an exact multiple of `divisor`.
pub fn expect_divisible(context: &'static str, value: usize, divisor: usize) -> Result<()> {
    if divisor != 0 && value % divisor == 0 {
        Ok(())
    } else {
        Err(LayerError::shape(
            context,
            format!("{value} is not divisible by {divisor}"),
        ))
    }
}

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];
