//! Per-layer key/value cache threaded through incremental decoding.
//!
//! A [`LayerCache`] holds at most one [`CachedProjections`] entry per
//! [`AttentionKind`]. The decoding loop owns the cache and passes it to each
//! attention sublayer of a layer; an absent entry means nothing has been
//! cached for that kind yet.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::core::{AttentionError, AttentionKind, Result};

/// Projected, head-split keys and values of one attention sublayer.
#[derive(Debug, Clone)]
pub struct CachedProjections {
    /// `[batch, heads, cached_len, key_head_dim]`
    pub key_projected: Tensor,
    /// `[batch, heads, cached_len, value_head_dim]`
    pub value_projected: Tensor,
}

impl CachedProjections {
    pub fn new(key_projected: Tensor, value_projected: Tensor) -> Result<Self> {
        let (kb, kh, k_len, _) = key_projected.dims4().map_err(|_| {
            AttentionError::shape(
                "kv_cache.keys",
                format!("expected rank 4 got {:?}", key_projected.dims()),
            )
        })?;
        let (vb, vh, v_len, _) = value_projected.dims4().map_err(|_| {
            AttentionError::shape(
                "kv_cache.values",
                format!("expected rank 4 got {:?}", value_projected.dims()),
            )
        })?;
        if (kb, kh, k_len) != (vb, vh, v_len) {
            return Err(AttentionError::shape(
                "kv_cache.values",
                format!(
                    "values {:?} do not match keys {:?} on batch, heads, or length",
                    value_projected.dims(),
                    key_projected.dims()
                ),
            ));
        }
        Ok(Self {
            key_projected,
            value_projected,
        })
    }

    /// Number of cached sequence positions.
    pub fn seq_len(&self) -> usize {
        self.key_projected.dims().get(2).copied().unwrap_or(0)
    }

    pub fn batch_size(&self) -> usize {
        self.key_projected.dims().first().copied().unwrap_or(0)
    }
}

/// Cache slots of one decoder layer, keyed by attention kind.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    slots: HashMap<AttentionKind, CachedProjections>,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &AttentionKind) -> Option<&CachedProjections> {
        self.slots.get(kind)
    }

    /// Stores `projections` for `kind`, returning the entry it replaced.
    pub fn insert(
        &mut self,
        kind: AttentionKind,
        projections: CachedProjections,
    ) -> Option<CachedProjections> {
        self.slots.insert(kind, projections)
    }

    pub fn contains(&self, kind: &AttentionKind) -> bool {
        self.slots.contains_key(kind)
    }

    pub fn remove(&mut self, kind: &AttentionKind) -> Option<CachedProjections> {
        self.slots.remove(kind)
    }

    /// Drops every slot, e.g. between independent decoding episodes.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Cached sequence length for `kind`, if an entry exists.
    pub fn seq_len(&self, kind: &AttentionKind) -> Option<usize> {
        self.slots.get(kind).map(CachedProjections::seq_len)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &AttentionKind> {
        self.slots.keys()
    }
}
