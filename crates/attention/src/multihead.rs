//! Multi-head scaled dot-product attention with incremental-decoding caches.
//!
//! A [`MultiHeadAttention`] projects queries, keys, and values with bias-free
//! linear maps, splits them into heads, and evaluates the exact kernel under
//! an additive mask built from the caller's `src_mask` and an optional static
//! causal bias. When a [`LayerCache`] is supplied, projected keys/values are
//! read from and written back to the slot named by the module's
//! [`AttentionKind`]:
//!
//! * self-attention appends the new projections after the cached ones;
//! * every other kind reuses its cached projections and ignores the supplied
//!   keys/values, since they attend to a fixed memory.
//!
//! The cache slot is written only after the whole call has succeeded.

use std::sync::{Mutex, OnceLock};

use candle_core::{DType, Device, Tensor};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    Dropout, SequenceLayer,
};

use crate::core::{Attention, AttentionConfig, AttentionError, AttentionKind, Result};
use crate::heads::HeadShaper;
use crate::kv_cache::{CachedProjections, LayerCache};
use crate::masks::{self, MASK_DTYPE};
use crate::reference::ExactAttention;

/// Projection matrices in `[out_features, in_features]` layout.
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    /// `[total_key_depth, input_depth]`
    pub query: Tensor,
    /// `[total_key_depth, input_depth]`
    pub key: Tensor,
    /// `[total_value_depth, input_depth]`
    pub value: Tensor,
    /// `[output_depth, total_value_depth]`
    pub output: Tensor,
}

impl AttentionWeights {
    /// Samples all four projections from `init`.
    pub fn sample(
        config: &AttentionConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        Ok(Self {
            query: init.sample(&[config.total_key_depth, config.input_depth], device, dtype)?,
            key: init.sample(&[config.total_key_depth, config.input_depth], device, dtype)?,
            value: init.sample(&[config.total_value_depth, config.input_depth], device, dtype)?,
            output: init.sample(&[config.output_depth, config.total_value_depth], device, dtype)?,
        })
    }
}

/// Multi-head attention sublayer.
#[derive(Debug)]
pub struct MultiHeadAttention {
    config: AttentionConfig,
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    shaper: HeadShaper,
    kernel: ExactAttention,
    bias_mask: Option<Tensor>,
    dropout: Dropout,
    policy: PrecisionPolicy,
    last_weights: Mutex<Option<Tensor>>,
    first_call: OnceLock<()>,
}

impl MultiHeadAttention {
    /// Builds a module with randomly initialised projections.
    ///
    /// `bias_mask`, when given, must be shaped `[1, 1, max_len, max_len]`
    /// (see [`masks::build_bias_mask`]).
    pub fn new(
        config: AttentionConfig,
        bias_mask: Option<Tensor>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        // Uniform in +-1/sqrt(fan_in).
        let init = LinearInit::KaimingUniform {
            negative_slope: 5.0f64.sqrt(),
        };
        let weights = AttentionWeights::sample(&config, &init, device, dtype)?;
        Self::from_weights(config, weights, bias_mask)
    }

    /// Builds a module from explicit projection weights.
    ///
    /// Parameters are stored in the dtype of `weights.query`; computation is
    /// promoted to `f32` for reduced-precision storage.
    pub fn from_weights(
        config: AttentionConfig,
        weights: AttentionWeights,
        bias_mask: Option<Tensor>,
    ) -> Result<Self> {
        config.validate()?;
        let dtype = weights.query.dtype();
        let query = Linear::new(
            LinearConfig::no_bias(config.input_depth, config.total_key_depth),
            weights.query,
            None,
        )?;
        let key = Linear::new(
            LinearConfig::no_bias(config.input_depth, config.total_key_depth),
            weights.key,
            None,
        )?;
        let value = Linear::new(
            LinearConfig::no_bias(config.input_depth, config.total_value_depth),
            weights.value,
            None,
        )?;
        let output = Linear::new(
            LinearConfig::no_bias(config.total_value_depth, config.output_depth),
            weights.output,
            None,
        )?;
        let bias_mask = bias_mask
            .map(|mask| -> Result<Tensor> {
                masks::validate_bias_mask(&mask)?;
                Ok(mask.to_dtype(MASK_DTYPE)?)
            })
            .transpose()?;

        Ok(Self {
            shaper: HeadShaper::new(config.num_heads)?,
            kernel: ExactAttention::new(config.query_scale()),
            dropout: Dropout::new(config.dropout_p, config.seed)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            query,
            key,
            value,
            output,
            bias_mask,
            config,
            last_weights: Mutex::new(None),
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn kind(&self) -> &AttentionKind {
        &self.config.kind
    }

    pub fn bias_mask(&self) -> Option<&Tensor> {
        self.bias_mask.as_ref()
    }

    /// Longest key sequence the static bias mask covers.
    pub fn max_len(&self) -> Option<usize> {
        self.bias_mask.as_ref().map(|mask| mask.dims()[2])
    }

    /// Switches attention dropout between training and evaluation behaviour.
    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Softmax probabilities `[batch, heads, q_len, k_len]` of the most recent
    /// forward call, taken before dropout.
    pub fn last_attention_weights(&self) -> Option<Tensor> {
        match self.last_weights.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Attends `queries` `[batch, q_len, input_depth]` over `keys`/`values`
    /// `[batch, k_len, input_depth]` and returns `[batch, q_len, output_depth]`.
    ///
    /// `src_mask` is an additive mask broadcastable to
    /// `[batch, heads, q_len, k_len]`, where `k_len` includes cached positions.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        src_mask: Option<&Tensor>,
        layer_cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        self.log_first_call();
        checks::expect_batch_seq_hidden("attention.queries", queries, self.config.input_depth)?;
        let (batch, q_len, _) = queries.dims3()?;

        let q = self.project(&self.query, queries)?;
        let cached = layer_cache
            .as_deref()
            .and_then(|cache| cache.get(&self.config.kind));
        let resolved = self.resolve_keys_values(keys, values, cached, batch)?;

        let k_len = resolved.seq_len();
        let mask = self.combined_mask(src_mask, batch, q_len, k_len)?;
        let attended = self.kernel.attend(
            &q,
            &resolved.key_projected,
            &resolved.value_projected,
            mask.as_ref(),
            &self.dropout,
        )?;

        let merged = self.shaper.merge(&attended.context)?;
        let output = self.output.forward(&merged, &self.policy)?;

        self.store_weights(attended.weights);
        if let Some(cache) = layer_cache {
            cache.insert(self.config.kind.clone(), resolved);
        }
        Ok(output)
    }

    fn log_first_call(&self) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::multihead init kind={} heads={} key_depth={} value_depth={} output_depth={} scale={:.6} max_len={:?} dropout={:?} precision={:?}",
                self.config.kind,
                self.config.num_heads,
                self.config.total_key_depth,
                self.config.total_value_depth,
                self.config.output_depth,
                self.kernel.query_scale(),
                self.max_len(),
                self.config.dropout_p,
                self.policy.compute()
            );
        }
    }

    /// Projects `[batch, seq, input_depth]` and splits it into dense heads.
    fn project(&self, projection: &Linear, input: &Tensor) -> Result<Tensor> {
        let projected = projection.forward(input, &self.policy)?;
        Ok(self.shaper.split(&projected)?.contiguous()?)
    }

    fn project_keys_values(&self, keys: &Tensor, values: &Tensor) -> Result<CachedProjections> {
        checks::expect_batch_seq_hidden("attention.keys", keys, self.config.input_depth)?;
        checks::expect_batch_seq_hidden("attention.values", values, self.config.input_depth)?;
        if keys.dims()[..2] != values.dims()[..2] {
            return Err(AttentionError::shape(
                "attention.values",
                format!(
                    "values {:?} must match keys {:?} on batch and sequence",
                    values.dims(),
                    keys.dims()
                ),
            ));
        }
        CachedProjections::new(
            self.project(&self.key, keys)?,
            self.project(&self.value, values)?,
        )
    }

    fn resolve_keys_values(
        &self,
        keys: &Tensor,
        values: &Tensor,
        cached: Option<&CachedProjections>,
        batch: usize,
    ) -> Result<CachedProjections> {
        let resolved = match (cached, &self.config.kind) {
            (Some(entry), AttentionKind::SelfAttention) => {
                let fresh = self.project_keys_values(keys, values)?;
                self.check_cached(entry, batch)?;
                log::debug!(
                    "attention::multihead kind={} extending cache {} -> {}",
                    self.config.kind,
                    entry.seq_len(),
                    entry.seq_len() + fresh.seq_len()
                );
                CachedProjections::new(
                    Tensor::cat(&[&entry.key_projected, &fresh.key_projected], 2)?,
                    Tensor::cat(&[&entry.value_projected, &fresh.value_projected], 2)?,
                )?
            }
            (Some(entry), _) => {
                self.check_cached(entry, batch)?;
                log::debug!(
                    "attention::multihead kind={} reusing {} cached positions",
                    self.config.kind,
                    entry.seq_len()
                );
                entry.clone()
            }
            (None, _) => self.project_keys_values(keys, values)?,
        };
        Ok(resolved)
    }

    fn check_cached(&self, entry: &CachedProjections, batch: usize) -> Result<()> {
        let key_dims = entry.key_projected.dims();
        let value_dims = entry.value_projected.dims();
        let heads = self.config.num_heads;
        if entry.batch_size() != batch
            || key_dims[1] != heads
            || key_dims[3] != self.config.key_head_dim()
            || value_dims[3] != self.config.value_head_dim()
        {
            return Err(AttentionError::shape(
                "attention.layer_cache",
                format!(
                    "cached keys {key_dims:?} / values {value_dims:?} do not fit batch {batch} with {heads} heads"
                ),
            ));
        }
        Ok(())
    }

    /// Sum of the broadcast `src_mask` and the bias-mask window, if any.
    fn combined_mask(
        &self,
        src_mask: Option<&Tensor>,
        batch: usize,
        q_len: usize,
        k_len: usize,
    ) -> Result<Option<Tensor>> {
        let target = (batch, self.config.num_heads, q_len, k_len);
        let src = src_mask
            .map(|mask| masks::expand_additive_mask("attention.src_mask", mask, target))
            .transpose()?;
        let bias = self
            .bias_mask
            .as_ref()
            .map(|mask| masks::bias_window(mask, q_len, k_len))
            .transpose()?;
        let combined = match (src, bias) {
            (Some(src), Some(bias)) => Some(src.broadcast_add(&bias)?),
            (Some(src), None) => Some(src),
            (None, Some(bias)) => Some(bias),
            (None, None) => None,
        };
        Ok(combined)
    }

    fn store_weights(&self, weights: Tensor) {
        let mut guard = match self.last_weights.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(weights);
    }
}

#[cfg(test)]
mod tests;
