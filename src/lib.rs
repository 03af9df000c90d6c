//! Attention and positionwise feed-forward sublayers of a Transformer decoder.
//!
//! This crate re-exports the [`attention`] and [`layers`] workspace crates and
//! adds [`SublayerConfig`], a file-backed description of one layer's
//! sublayers.

pub mod config;

pub use attention;
pub use layers;

pub use attention::{
    AttentionConfig, AttentionError, AttentionKind, LayerCache, MultiHeadAttention,
};
pub use config::{ConfigError, SublayerConfig};
pub use layers::{
    Conv, ConvConfig, FeedForwardConfig, LayerError, PadType, PositionwiseFeedForward,
};
