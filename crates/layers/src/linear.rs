//! Dense projection layers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` (or `(rows,
//! in_dim)`) and return the same leading layout with `out_dim` features. The
//! weight is stored as `[out_dim, in_dim]`. Matmuls run in
//! [`PrecisionPolicy::compute`] and the result is cast back with
//! [`PrecisionPolicy::cast_to_storage`]. Initialisation policies are the
//! uniform Glorot and Kaiming draws.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{checks, dtypes::PrecisionPolicy, LayerError, Result, SequenceLayer};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Creates a configuration for a projection without bias.
    pub fn no_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(LayerError::Configuration(format!(
                "linear dimensions must be positive, got {} -> {}",
                self.input_dim, self.output_dim
            )));
        }
        Ok(())
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Kaiming/He uniform initialisation. A slope of `sqrt(5)` gives
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    KaimingUniform { negative_slope: f64 },
}

impl LinearInit {
    /// Samples a tensor of `shape` whose first dim is the fan-out and whose
    /// remaining dims multiply to the fan-in (`[out, in]` or `[out, in, k]`).
    pub fn sample(&self, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let fan_out = shape.first().copied().unwrap_or(1) as f64;
        let fan_in = shape.iter().skip(1).product::<usize>().max(1) as f64;
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        Ok(weight.to_dtype(dtype)?)
    }
}

impl Default for LinearInit {
    fn default() -> Self {
        LinearInit::XavierUniform
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        config.validate()?;
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let weight = init.sample(&[config.output_dim, config.input_dim], device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the `[out_dim, in_dim]` weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_shape("linear.weight", weight, &[config.output_dim, config.input_dim])?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(LayerError::Configuration(
                "bias provided but config disables bias".into(),
            )),
            (true, None) => Err(LayerError::Configuration(
                "config expects bias but none supplied".into(),
            )),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [_, _, _] => checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim),
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            dims => Err(LayerError::shape(
                "linear.input",
                format!(
                    "expected [B, T, {in_dim}] or [T, {in_dim}], got {dims:?}",
                    in_dim = self.config.input_dim
                ),
            )),
        }
    }
}

impl SequenceLayer for Linear {
    fn input_dim(&self) -> usize {
        self.config.input_dim
    }

    fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_compute(hidden)?;
        let weight_t = policy.cast_for_compute(&self.weight)?.t()?;

        let mut output = match *input.dims() {
            [batch, seq, _] => input
                .reshape((batch * seq, self.config.input_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, self.config.output_dim))?,
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_compute(bias)?)?;
        }

        Ok(policy.cast_to_storage(&output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        let mut out = input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .reshape((batch, seq, weight.dims()[0]))?;
        if let Some(bias) = bias {
            out = out.broadcast_add(bias)?;
        }
        Ok(out)
    }

    fn tensor_std(tensor: &Tensor) -> Result<f64> {
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().copied().map(f64::from).sum::<f64>() / values.len() as f64;
        let var = values
            .iter()
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>()
            / values.len() as f64;
        Ok(var.sqrt())
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12);
        let weight = Tensor::randn(0f32, 0.05, (12, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 12, &device)?;

        for dtype in [DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?.to_dtype(dtype)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input, &policy)?;

            assert_eq!(output.dims(), &[2, 5, 12]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input.to_dtype(DType::F32)?, &weight, Some(&bias))?;
            let max = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 2e-2,
                _ => 1e-4,
            };
            assert!(max <= tol, "max diff {max} for {dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_input_width() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::no_bias(4, 4),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let input = Tensor::zeros((1, 3, 5), DType::F32, &device)?;
        let err = linear.forward(&input, &PrecisionPolicy::default()).unwrap_err();
        assert!(matches!(err, LayerError::ShapeContract { .. }));
        Ok(())
    }

    #[test]
    fn bias_flag_must_match_parameters() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let bias = Tensor::zeros(2, DType::F32, &device).unwrap();
        assert!(matches!(
            Linear::new(LinearConfig::no_bias(2, 2), weight.clone(), Some(bias)),
            Err(LayerError::Configuration(_))
        ));
        assert!(matches!(
            Linear::new(LinearConfig::new(2, 2), weight, None),
            Err(LayerError::Configuration(_))
        ));
    }

    #[test]
    fn glorot_uniform_stays_within_bound() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let bound = (6.0f32 / (128.0 + 64.0)).sqrt();
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound + 1e-6);
        let std = tensor_std(linear.weight())?;
        let expected = f64::from(bound) / 3.0f64.sqrt();
        assert!((std - expected).abs() < expected * 0.25);
        Ok(())
    }

    #[test]
    fn kaiming_uniform_with_sqrt5_slope_is_bounded_by_fan_in() -> Result<()> {
        let device = Device::Cpu;
        let init = LinearInit::KaimingUniform {
            negative_slope: 5.0f64.sqrt(),
        };
        // Conv weights are `[out, in, k]`, so fan-in covers the kernel too.
        let weight = init.sample(&[16, 4, 3], &device, DType::F32)?;
        let bound = 1.0 / 12.0f32.sqrt();
        let max = weight.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound + 1e-6);
        let std = tensor_std(&weight)?;
        let expected = f64::from(bound) / 3.0f64.sqrt();
        assert!((std - expected).abs() < expected * 0.3);
        Ok(())
    }

    #[test]
    fn with_init_starts_bias_at_zero() -> Result<()> {
        let linear = Linear::with_init(
            LinearConfig::new(4, 3),
            &LinearInit::default(),
            &Device::Cpu,
            DType::F32,
        )?;
        let bias = linear.bias().expect("bias enabled").to_vec1::<f32>()?;
        assert_eq!(bias, vec![0.0; 3]);
        Ok(())
    }
}
