//! Activation catalogue for the positionwise feed-forward stack.
//!
//! Activations consume tensors of any shape and return tensors with identical
//! layout. Inputs are promoted to [`PrecisionPolicy::compute`] before the
//! non-linearity is evaluated and cast back to the storage dtype afterwards.
//!
//! * **ReLU** `max(x, 0)`, the default between feed-forward sublayers.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Non-linearity applied after each feed-forward sublayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Rectified linear unit.
    #[default]
    Relu,
    /// Erf-based GELU.
    Gelu,
}

impl ActivationKind {
    /// Applies the activation to `input` using the precision rules in `policy`.
    pub fn apply(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_compute(input)?;
        let activated = match self {
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
        };
        policy.cast_to_storage(&activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn relu_zeroes_negative_values() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.0f32, -0.5, 0.0, 1.5], (4,), &device)?;
        let output = ActivationKind::Relu.apply(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.to_vec1::<f32>()?, vec![0.0, 0.0, 0.0, 1.5]);
        Ok(())
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = ActivationKind::Gelu.apply(&input, &policy)?;

        let scaled = input.affine(1.0 / SQRT_2, 0.0)?;
        let inner = (Tensor::ones_like(&scaled)? + scaled.erf()?)?;
        let reference = input.affine(0.5, 0.0)?.broadcast_mul(&inner)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn reduced_precision_output_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let input = Tensor::from_slice(&[-1.0f32, 2.0], (2,), &device)?.to_dtype(DType::F16)?;
        let output = ActivationKind::Gelu.apply(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F16);
        let values = output.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert!((values[0] + 0.1587).abs() < 1e-2);
        assert!((values[1] - 1.9545).abs() < 1e-2);
        Ok(())
    }
}
