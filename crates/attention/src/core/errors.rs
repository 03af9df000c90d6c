//! Error types emitted by attention modules.

use layers::LayerError;
use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Inconsistent hyper-parameters, rejected before any tensor work.
    #[error("invalid attention configuration: {0}")]
    Configuration(String),
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}: {detail}")]
    InvalidShape {
        context: &'static str,
        detail: String,
    },
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: &'static str, detail: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context,
            detail: detail.into(),
        }
    }
}

impl From<LayerError> for AttentionError {
    fn from(err: LayerError) -> Self {
        match err {
            LayerError::Configuration(message) => AttentionError::Configuration(message),
            LayerError::ShapeContract { context, detail } => {
                AttentionError::InvalidShape { context, detail }
            }
            LayerError::Backend(err) => AttentionError::Backend(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
