//! Hyper-parameters of a multi-head attention sublayer.
//!
//! [`AttentionConfig`] is immutable once a module is built. Its
//! [`AttentionKind`] selects the key/value cache policy and names the slot the
//! module reads and writes in a [`LayerCache`](crate::kv_cache::LayerCache).

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Role of an attention sublayer inside a decoder layer.
///
/// Self-attention grows its cached keys/values every decoding step. Every other
/// kind attends to a fixed memory, so its projections are computed once and
/// then reused verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionKind {
    #[default]
    SelfAttention,
    EncoderAttention,
    /// Additional fixed-memory attention, e.g. over a knowledge or persona source.
    Other(String),
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKind::SelfAttention => f.write_str("self"),
            AttentionKind::EncoderAttention => f.write_str("encoder"),
            AttentionKind::Other(label) => write!(f, "other:{label}"),
        }
    }
}

/// Configuration driving a [`MultiHeadAttention`](crate::MultiHeadAttention) module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Hidden size of the incoming queries, keys, and values.
    pub input_depth: usize,
    /// Width of the projected keys (and queries) summed over heads.
    pub total_key_depth: usize,
    /// Width of the projected values summed over heads.
    pub total_value_depth: usize,
    pub output_depth: usize,
    pub num_heads: usize,
    /// Probability for dropout applied to attention weights during training.
    #[serde(default)]
    pub dropout_p: Option<f32>,
    #[serde(default)]
    pub kind: AttentionKind,
    /// Seed for the dropout mask generator.
    #[serde(default)]
    pub seed: u64,
}

impl AttentionConfig {
    /// Self-attention with equal key/value depths and no dropout.
    pub fn new(input_depth: usize, total_depth: usize, output_depth: usize, num_heads: usize) -> Self {
        Self {
            input_depth,
            total_key_depth: total_depth,
            total_value_depth: total_depth,
            output_depth,
            num_heads,
            dropout_p: None,
            kind: AttentionKind::SelfAttention,
            seed: 0,
        }
    }

    pub fn with_kind(mut self, kind: AttentionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_dropout(mut self, dropout_p: f32, seed: u64) -> Self {
        self.dropout_p = Some(dropout_p);
        self.seed = seed;
        self
    }

    pub fn key_head_dim(&self) -> usize {
        self.total_key_depth / self.num_heads.max(1)
    }

    pub fn value_head_dim(&self) -> usize {
        self.total_value_depth / self.num_heads.max(1)
    }

    /// `(total_key_depth / num_heads) ^ -0.5`
    pub fn query_scale(&self) -> f64 {
        (self.key_head_dim() as f64).powf(-0.5)
    }

    pub fn validate(&self) -> Result<()> {
        let depths = [
            ("input_depth", self.input_depth),
            ("total_key_depth", self.total_key_depth),
            ("total_value_depth", self.total_value_depth),
            ("output_depth", self.output_depth),
            ("num_heads", self.num_heads),
        ];
        if let Some((name, _)) = depths.iter().find(|(_, value)| *value == 0) {
            return Err(AttentionError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.total_key_depth % self.num_heads != 0 {
            return Err(AttentionError::Configuration(format!(
                "key depth ({}) must be divisible by the number of attention heads ({})",
                self.total_key_depth, self.num_heads
            )));
        }
        if self.total_value_depth % self.num_heads != 0 {
            return Err(AttentionError::Configuration(format!(
                "value depth ({}) must be divisible by the number of attention heads ({})",
                self.total_value_depth, self.num_heads
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::Configuration(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(())
    }
}
