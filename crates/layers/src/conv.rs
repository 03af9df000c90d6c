//! Padded 1-D convolution over `(batch, seq, hidden)` sequences.
//!
//! Candle's `conv1d` expects channels on axis 1, so inputs are transposed to
//! `(batch, hidden, seq)`, zero-padded along the sequence axis, convolved with
//! no implicit padding, and transposed back. Padding is applied explicitly so
//! that the left/both split is under our control:
//!
//! * [`PadType::Left`] pads `kernel_size - 1` positions on the left only, so the
//!   output at step `t` depends on inputs at steps `<= t`.
//! * [`PadType::Both`] pads `kernel_size / 2` on the left and
//!   `(kernel_size - 1) / 2` on the right, centring the receptive field.
//!
//! The right padding rounds down, not up (`ceil((k - 1) / 2)`). The two agree
//! for odd kernels, including the width-3 feed-forward kernel. For even
//! kernels rounding up would add one output step, so in both modes the output
//! sequence length equals the input length.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    checks, dtypes::PrecisionPolicy, linear::LinearInit, LayerError, Result, SequenceLayer,
};

/// Padding strategy for [`Conv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadType {
    /// Causal padding: only past positions are visible.
    #[default]
    Left,
    /// Centred padding for non-causal (encoder) use.
    Both,
}

impl PadType {
    /// Returns `(left, right)` zero padding for a kernel of width `kernel_size`.
    pub fn padding(&self, kernel_size: usize) -> (usize, usize) {
        match self {
            PadType::Left => (kernel_size.saturating_sub(1), 0),
            PadType::Both => (kernel_size / 2, kernel_size.saturating_sub(1) / 2),
        }
    }
}

/// Shape parameters of a [`Conv`] layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub input_size: usize,
    pub output_size: usize,
    pub kernel_size: usize,
    pub pad_type: PadType,
}

impl ConvConfig {
    pub fn new(input_size: usize, output_size: usize, kernel_size: usize, pad_type: PadType) -> Self {
        Self {
            input_size,
            output_size,
            kernel_size,
            pad_type,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.output_size == 0 || self.kernel_size == 0 {
            return Err(LayerError::Configuration(format!(
                "conv sizes must be positive, got in={} out={} kernel={}",
                self.input_size, self.output_size, self.kernel_size
            )));
        }
        Ok(())
    }
}

/// Zero-padded 1-D convolution with bias.
#[derive(Debug, Clone)]
pub struct Conv {
    config: ConvConfig,
    /// `[output_size, input_size, kernel_size]`
    weight: Tensor,
    /// `[output_size]`
    bias: Tensor,
}

impl Conv {
    /// Constructs a convolution from pre-existing parameters.
    pub fn new(config: ConvConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        config.validate()?;
        checks::expect_shape(
            "conv.weight",
            &weight,
            &[config.output_size, config.input_size, config.kernel_size],
        )?;
        checks::expect_dtype_in("conv.weight", &weight, checks::FLOAT_DTYPES)?;
        checks::expect_shape("conv.bias", &bias, &[config.output_size])?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a convolution with randomly initialised weights and zero bias.
    pub fn with_init(
        config: ConvConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let weight = init.sample(
            &[config.output_size, config.input_size, config.kernel_size],
            device,
            dtype,
        )?;
        let bias = Tensor::zeros(config.output_size, dtype, device)?;
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl SequenceLayer for Conv {
    fn input_dim(&self) -> usize {
        self.config.input_size
    }

    fn output_dim(&self) -> usize {
        self.config.output_size
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("conv.input", hidden, self.config.input_size)?;
        let (left, right) = self.config.pad_type.padding(self.config.kernel_size);

        let input = policy
            .cast_for_compute(hidden)?
            .transpose(1, 2)?
            .contiguous()?;
        let padded = input.pad_with_zeros(2, left, right)?;
        let kernel = policy.cast_for_compute(&self.weight)?;
        let bias = policy
            .cast_for_compute(&self.bias)?
            .reshape((1, self.config.output_size, 1))?;

        let convolved = padded.conv1d(&kernel, 0, 1, 1, 1)?.broadcast_add(&bias)?;
        let output = convolved.transpose(1, 2)?.contiguous()?;
        Ok(policy.cast_to_storage(&output)?)
    }
}
