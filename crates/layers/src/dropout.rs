//! Deterministic, seedable dropout shared by attention and feed-forward stacks.
//!
//! Masks are drawn from a small LCG owned by each [`Dropout`] instance, so a
//! fixed seed and training mode reproduce the same outputs. In evaluation mode
//! (or with probability `0.0`) the input passes through untouched. Kept
//! activations are rescaled by `1 / (1 - p)`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use candle_core::Tensor;

use crate::{dtypes::PrecisionPolicy, LayerError, Result};

/// Inverted dropout with a train/eval switch.
#[derive(Debug)]
pub struct Dropout {
    probability: f32,
    rng: Mutex<Lcg64>,
    training: AtomicBool,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let state = match self.rng.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Self {
            probability: self.probability,
            rng: Mutex::new(state),
            training: AtomicBool::new(self.training.load(Ordering::Relaxed)),
        }
    }
}

impl Dropout {
    /// Builds dropout from an optional probability; `None` behaves like `0.0`.
    ///
    /// Probabilities outside `[0, 1)` are rejected as configuration errors.
    pub fn new(probability: Option<f32>, seed: u64) -> Result<Self> {
        let p = probability.unwrap_or(0.0);
        if !(0.0..1.0).contains(&p) {
            return Err(LayerError::Configuration(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        Ok(Self {
            probability: p,
            rng: Mutex::new(Lcg64::new(seed)),
            training: AtomicBool::new(true),
        })
    }

    /// Dropout that never drops anything.
    pub fn disabled() -> Self {
        Self {
            probability: 0.0,
            rng: Mutex::new(Lcg64::new(0)),
            training: AtomicBool::new(false),
        }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Enables (training) or disables (evaluation) stochastic dropping.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Whether a call to [`Dropout::forward`] would modify its input.
    pub fn is_active(&self) -> bool {
        self.probability > 0.0 && self.is_training()
    }

    /// Applies dropout to a tensor of any rank.
    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(tensor.clone());
        }
        let keep_prob = 1.0 - self.probability;
        let total = tensor.elem_count();
        let mask_data = {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (0..total)
                .map(|_| if rng.next_f32() < keep_prob { 1.0f32 } else { 0.0 })
                .collect::<Vec<_>>()
        };
        let compute = policy.cast_for_compute(tensor)?;
        let mask = Tensor::from_vec(mask_data, tensor.dims(), tensor.device())?
            .to_dtype(compute.dtype())?;
        let dropped = compute
            .mul(&mask)?
            .affine(1.0 / f64::from(keep_prob), 0.0)?;
        Ok(policy.cast_to_storage(&dropped)?)
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub(crate) struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX multiplier.
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
