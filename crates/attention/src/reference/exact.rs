//! Reference attention kernel computing in `f32`.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::{dtypes::PrecisionPolicy, Dropout};

use crate::core::{Attended, Attention, AttentionError, Result};
use crate::masks::expand_additive_mask;

/// Numerically stable attention kernel with a fixed query scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExactAttention {
    query_scale: f64,
}

impl ExactAttention {
    /// Kernel multiplying queries by `query_scale` before the dot product.
    pub fn new(query_scale: f64) -> Self {
        Self { query_scale }
    }

    /// Kernel using the conventional `head_dim ^ -0.5` scale.
    pub fn for_head_dim(head_dim: usize) -> Self {
        Self::new((head_dim.max(1) as f64).powf(-0.5))
    }

    pub fn query_scale(&self) -> f64 {
        self.query_scale
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout: &Dropout,
    ) -> Result<Attended> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape(
                "attention.inputs",
                "q, k, v must reside on the same device",
            ));
        }

        let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| {
            AttentionError::shape(
                "attention.q",
                format!("expected [batch, heads, seq_len, head_dim] got {:?}", q.dims()),
            )
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| {
            AttentionError::shape(
                "attention.k",
                format!("expected [batch, heads, seq_len, head_dim] got {:?}", k.dims()),
            )
        })?;
        let (vb, vh, vk, _) = v.dims4().map_err(|_| {
            AttentionError::shape(
                "attention.v",
                format!("expected [batch, heads, seq_len, head_dim] got {:?}", v.dims()),
            )
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(
                "attention.k",
                format!(
                    "expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            ));
        }
        if vb != batch || vh != heads || vk != k_len {
            return Err(AttentionError::shape(
                "attention.v",
                format!("expected [{batch}, {heads}, {k_len}, ?] got {:?}", v.dims()),
            ));
        }

        let q_work = q.to_dtype(DType::F32)?.affine(self.query_scale, 0.0)?;
        let k_work = k.to_dtype(DType::F32)?;
        let v_work = v.to_dtype(DType::F32)?.contiguous()?;

        let k_t = k_work.transpose(2, 3)?.contiguous()?;
        let mut logits = q_work.contiguous()?.matmul(&k_t)?;
        if let Some(mask) = mask {
            let mask = expand_additive_mask("attention.mask", mask, (batch, heads, q_len, k_len))?;
            logits = logits.add(&mask)?;
        }

        let weights = softmax_last_dim(&logits)?;
        let probs = dropout.forward(&weights, &PrecisionPolicy::default())?;
        let context = probs.matmul(&v_work)?.to_dtype(q.dtype())?;

        Ok(Attended { context, weights })
    }
}
