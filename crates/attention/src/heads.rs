//! Reshaping between `[batch, seq, depth]` and per-head layouts.

use candle_core::Tensor;
use layers::checks;

use crate::core::{AttentionError, Result};

/// Splits the feature axis into heads and merges it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadShaper {
    num_heads: usize,
}

impl HeadShaper {
    pub fn new(num_heads: usize) -> Result<Self> {
        if num_heads == 0 {
            return Err(AttentionError::Configuration(
                "number of heads must be greater than zero".to_string(),
            ));
        }
        Ok(Self { num_heads })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// `[batch, seq, depth]` to `[batch, heads, seq, depth / heads]`.
    ///
    /// The result is a permuted view; callers that need a dense layout must
    /// materialize it.
    pub fn split(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, seq, depth) = match tensor.dims() {
            [b, s, d] => (*b, *s, *d),
            dims => {
                return Err(AttentionError::shape(
                    "heads.split",
                    format!("expected [batch, seq, depth] got {dims:?}"),
                ))
            }
        };
        checks::expect_divisible("heads.split", depth, self.num_heads)?;
        let reshaped = tensor.reshape((batch, seq, self.num_heads, depth / self.num_heads))?;
        Ok(reshaped.permute((0, 2, 1, 3))?)
    }

    /// `[batch, heads, seq, head_dim]` to `[batch, seq, heads * head_dim]`.
    pub fn merge(&self, tensor: &Tensor) -> Result<Tensor> {
        checks::expect_rank("heads.merge", tensor, 4)?;
        let (batch, heads, seq, head_dim) = tensor.dims4()?;
        if heads != self.num_heads {
            return Err(AttentionError::shape(
                "heads.merge",
                format!("expected {} heads got {heads}", self.num_heads),
            ));
        }
        let permuted = tensor.permute((0, 2, 1, 3))?.contiguous()?;
        Ok(permuted.reshape((batch, seq, heads * head_dim))?)
    }
}
