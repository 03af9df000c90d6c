//! File-backed configuration for one decoder layer's sublayers.
//!
//! A [`SublayerConfig`] is read from JSON or TOML (chosen by file extension)
//! and validated as a whole before any module is built:
//!
//! ```toml
//! max_len = 512
//!
//! [attention]
//! input_depth = 256
//! total_key_depth = 256
//! total_value_depth = 256
//! output_depth = 256
//! num_heads = 8
//!
//! [feed_forward]
//! input_depth = 256
//! filter_size = 1024
//! output_depth = 256
//! layer_config = "cc"
//! padding = "left"
//! ```

use std::{fs, path::Path};

use attention::{masks::build_bias_mask, AttentionConfig, MultiHeadAttention};
use candle_core::{DType, Device};
use layers::{FeedForwardConfig, PositionwiseFeedForward};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported configuration format: {0}")]
    Format(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Attention and feed-forward settings of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SublayerConfig {
    pub attention: AttentionConfig,
    pub feed_forward: FeedForwardConfig,
    /// Length of the static causal bias mask; `None` attaches no bias.
    #[serde(default)]
    pub max_len: Option<usize>,
}

impl SublayerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: SublayerConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks both sections, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if let Err(err) = self.attention.validate() {
            errors.push(format!("attention: {err}"));
        }
        if let Err(err) = self.feed_forward.validate() {
            errors.push(format!("feed_forward: {err}"));
        }
        if self.max_len == Some(0) {
            errors.push("max_len must be greater than zero".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Builds the attention sublayer, attaching a causal bias of `max_len`
    /// positions when one is configured.
    pub fn build_attention(
        &self,
        device: &Device,
        dtype: DType,
    ) -> attention::Result<MultiHeadAttention> {
        let bias_mask = self
            .max_len
            .map(|max_len| build_bias_mask(max_len, device))
            .transpose()?;
        MultiHeadAttention::new(self.attention.clone(), bias_mask, device, dtype)
    }

    pub fn build_feed_forward(
        &self,
        device: &Device,
        dtype: DType,
    ) -> layers::Result<PositionwiseFeedForward> {
        PositionwiseFeedForward::new(self.feed_forward.clone(), device, dtype)
    }
}
