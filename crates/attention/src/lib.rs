//! Multi-head attention sublayers with incremental-decoding caches.
//!
//! The crate exposes [`MultiHeadAttention`], which projects `[batch, seq,
//! input_depth]` queries, keys, and values, splits them into heads with
//! [`HeadShaper`], and evaluates scaled dot-product attention through the
//! [`Attention`] kernel seam. Reductions are performed in `f32`; outputs match
//! the parameter storage dtype (bf16, f16, or f32).
//!
//! Masks are additive. A static causal bias built with
//! [`masks::build_bias_mask`] can be attached at construction, and a per-call
//! `src_mask` (for example a padding mask) is added on top of it.
//!
//! During decoding a caller-owned [`LayerCache`] is threaded through repeated
//! forward calls. Dropout on attention weights is a train-only concern toggled
//! with [`MultiHeadAttention::set_training`].

pub mod core;
pub mod heads;
pub mod kv_cache;
pub mod masks;
pub mod multihead;
pub mod reference;

pub use core::{Attended, Attention, AttentionConfig, AttentionError, AttentionKind, Result};
pub use heads::HeadShaper;
pub use kv_cache::{CachedProjections, LayerCache};
pub use multihead::{AttentionWeights, MultiHeadAttention};
pub use reference::ExactAttention;
