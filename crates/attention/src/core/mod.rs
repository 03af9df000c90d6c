//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`
//! and accumulate in `f32` regardless of the incoming dtype (`bf16`, `f16`, or
//! `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;
use layers::Dropout;

pub use config::{AttentionConfig, AttentionKind};
pub use errors::{AttentionError, Result};

/// Result of one attention evaluation.
#[derive(Debug, Clone)]
pub struct Attended {
    /// `[batch, heads, q_len, value_head_dim]`, in the dtype of `q`.
    pub context: Tensor,
    /// Softmax probabilities `[batch, heads, q_len, k_len]` in `f32`, taken
    /// before dropout.
    pub weights: Tensor,
}

/// Unified interface for scaled dot-product attention kernels.
///
/// * `q` is `[batch, heads, q_len, key_head_dim]`, `k` is
///   `[batch, heads, k_len, key_head_dim]`, and `v` is
///   `[batch, heads, k_len, value_head_dim]`.
/// * `mask`, when present, is additive and broadcastable to
///   `[batch, heads, q_len, k_len]`.
/// * `dropout` is applied to the probabilities only while it is active.
pub trait Attention: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout: &Dropout,
    ) -> Result<Attended>;
}
