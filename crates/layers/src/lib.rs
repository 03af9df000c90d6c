//! Building blocks for transformer sublayers.
//!
//! This crate hosts the positionwise feed-forward stack together with the
//! projection, convolution, activation, and dropout components it is
//! assembled from. Everything operates on Candle tensors laid out as
//! `(batch, seq, hidden)`.

pub mod activations;
pub mod checks;
pub mod conv;
pub mod dropout;
pub mod dtypes;
pub mod feed_forward;
pub mod linear;

use candle_core::Tensor;
use thiserror::Error;

use crate::dtypes::PrecisionPolicy;

pub use conv::{Conv, ConvConfig, PadType};
pub use dropout::Dropout;
pub use feed_forward::{FeedForwardConfig, PositionwiseFeedForward, SublayerKind, SublayerSpec};
pub use linear::{Linear, LinearConfig, LinearInit};

/// Errors raised while building or running layer components.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Rejected at construction time; never deferred to a forward call.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// An input tensor violated the documented shape contract.
    #[error("shape contract violated for {context}: {detail}")]
    ShapeContract {
        context: &'static str,
        detail: String,
    },
    /// Failure reported by the tensor backend.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl LayerError {
    pub(crate) fn shape(context: &'static str, detail: impl Into<String>) -> Self {
        LayerError::ShapeContract {
            context,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Common capability shared by every sublayer that maps
/// `(batch, seq, input_dim)` to `(batch, seq', output_dim)`.
pub trait SequenceLayer: Send + Sync {
    /// Feature dimension expected on the last axis of the input.
    fn input_dim(&self) -> usize;

    /// Feature dimension produced on the last axis of the output.
    fn output_dim(&self) -> usize;

    /// Applies the layer, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}
