use super::*;
use crate::masks::{build_bias_mask, padding_mask_from_booleans, padding_mask_from_lengths};
use static_assertions::assert_impl_all;

assert_impl_all!(MultiHeadAttention: Send, Sync);

const DEPTH: usize = 8;
const HEADS: usize = 2;

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_vec0::<f32>()
        .unwrap()
}

fn self_attention(max_len: usize) -> Result<MultiHeadAttention> {
    let device = Device::Cpu;
    MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS),
        Some(build_bias_mask(max_len, &device)?),
        &device,
        DType::F32,
    )
}

fn row_sums(weights: &Tensor) -> Vec<f32> {
    weights
        .sum_keepdim(3)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn forward_shapes_and_normalised_weights() -> Result<()> {
    let mha = MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, 12, 6, HEADS),
        None,
        &Device::Cpu,
        DType::F32,
    )?;
    assert!(mha.last_attention_weights().is_none());

    let x = Tensor::randn(0f32, 1.0, (2, 5, DEPTH), &Device::Cpu)?;
    let out = mha.forward(&x, &x, &x, None, None)?;
    assert_eq!(out.dims(), &[2, 5, 6]);

    let weights = mha.last_attention_weights().expect("weights recorded");
    assert_eq!(weights.dims(), &[2, HEADS, 5, 5]);
    assert!(row_sums(&weights).iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn indivisible_depths_are_rejected_at_construction() {
    let err = MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, 10, DEPTH, 4),
        None,
        &Device::Cpu,
        DType::F32,
    )
    .unwrap_err();
    assert!(matches!(err, AttentionError::Configuration(_)));
}

#[test]
fn malformed_bias_mask_is_rejected_at_construction() -> Result<()> {
    let device = Device::Cpu;
    let bad = Tensor::zeros((2, 1, 4, 4), DType::F32, &device)?;
    let err = MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS),
        Some(bad),
        &device,
        DType::F32,
    )
    .unwrap_err();
    assert!(matches!(err, AttentionError::Configuration(_)));
    Ok(())
}

#[test]
fn causal_bias_puts_no_mass_on_future_keys() -> Result<()> {
    let mha = self_attention(8)?;
    let x = Tensor::randn(0f32, 1.0, (1, 6, DEPTH), &Device::Cpu)?;
    mha.forward(&x, &x, &x, None, None)?;
    let weights = mha
        .last_attention_weights()
        .expect("weights recorded")
        .flatten_all()?
        .to_vec1::<f32>()?;
    for h in 0..HEADS {
        for q in 0..6 {
            for k in (q + 1)..6 {
                assert_eq!(weights[(h * 6 + q) * 6 + k], 0.0, "head {h} q {q} k {k}");
            }
        }
    }
    Ok(())
}

#[test]
fn incremental_decoding_matches_full_sequence() -> Result<()> {
    let mha = self_attention(16)?;
    let seq = 5;
    let x = Tensor::randn(0f32, 1.0, (2, seq, DEPTH), &Device::Cpu)?;
    let full = mha.forward(&x, &x, &x, None, None)?;

    let mut cache = LayerCache::new();
    for t in 0..seq {
        let step = x.narrow(1, t, 1)?;
        let out = mha.forward(&step, &step, &step, None, Some(&mut cache))?;
        assert_eq!(cache.seq_len(&AttentionKind::SelfAttention), Some(t + 1));
        let diff = max_abs_diff(&out, &full.narrow(1, t, 1)?);
        assert!(diff < 1e-5, "step {t} diverged by {diff}");
    }
    Ok(())
}

#[test]
fn chunked_prefill_then_decode_matches_full_sequence() -> Result<()> {
    let mha = self_attention(16)?;
    let x = Tensor::randn(0f32, 1.0, (1, 6, DEPTH), &Device::Cpu)?;
    let full = mha.forward(&x, &x, &x, None, None)?;

    let mut cache = LayerCache::new();
    let prefix = x.narrow(1, 0, 4)?;
    let prefix_out = mha.forward(&prefix, &prefix, &prefix, None, Some(&mut cache))?;
    assert!(max_abs_diff(&prefix_out, &full.narrow(1, 0, 4)?) < 1e-5);

    let tail = x.narrow(1, 4, 2)?;
    let tail_out = mha.forward(&tail, &tail, &tail, None, Some(&mut cache))?;
    assert!(max_abs_diff(&tail_out, &full.narrow(1, 4, 2)?) < 1e-5);
    assert_eq!(cache.seq_len(&AttentionKind::SelfAttention), Some(6));
    Ok(())
}

#[test]
fn cross_attention_reuses_cached_memory() -> Result<()> {
    let device = Device::Cpu;
    let mha = MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS).with_kind(AttentionKind::EncoderAttention),
        None,
        &device,
        DType::F32,
    )?;
    let memory = Tensor::randn(0f32, 1.0, (2, 7, DEPTH), &device)?;
    let mut cache = LayerCache::new();

    for step in 0..4 {
        let query = Tensor::randn(0f32, 1.0, (2, 1, DEPTH), &device)?;
        let expected = mha.forward(&query, &memory, &memory, None, None)?;
        // After the first step the supplied keys/values are ignored entirely.
        let keys = if step == 0 {
            memory.clone()
        } else {
            Tensor::zeros((2, 1, DEPTH), DType::F32, &device)?
        };
        let out = mha.forward(&query, &keys, &keys, None, Some(&mut cache))?;
        assert!(max_abs_diff(&out, &expected) < 1e-6);
        assert_eq!(cache.seq_len(&AttentionKind::EncoderAttention), Some(7));
    }
    assert!(!cache.contains(&AttentionKind::SelfAttention));
    Ok(())
}

#[test]
fn other_kinds_use_separate_slots() -> Result<()> {
    let device = Device::Cpu;
    let build = |label: &str| {
        MultiHeadAttention::new(
            AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS)
                .with_kind(AttentionKind::Other(label.to_string())),
            None,
            &device,
            DType::F32,
        )
    };
    let knowledge = build("knowledge")?;
    let persona = build("persona")?;
    let query = Tensor::randn(0f32, 1.0, (1, 1, DEPTH), &device)?;
    let mem_a = Tensor::randn(0f32, 1.0, (1, 3, DEPTH), &device)?;
    let mem_b = Tensor::randn(0f32, 1.0, (1, 9, DEPTH), &device)?;

    let mut cache = LayerCache::new();
    knowledge.forward(&query, &mem_a, &mem_a, None, Some(&mut cache))?;
    persona.forward(&query, &mem_b, &mem_b, None, Some(&mut cache))?;
    assert_eq!(cache.seq_len(&AttentionKind::Other("knowledge".into())), Some(3));
    assert_eq!(cache.seq_len(&AttentionKind::Other("persona".into())), Some(9));
    Ok(())
}

#[test]
fn single_key_returns_projected_value() -> Result<()> {
    let device = Device::Cpu;
    let config = AttentionConfig::new(4, 4, 4, 2);
    let eye = Tensor::eye(4, DType::F32, &device)?;
    let weights = AttentionWeights {
        query: Tensor::randn(0f32, 1.0, (4, 4), &device)?,
        key: Tensor::randn(0f32, 1.0, (4, 4), &device)?,
        value: eye.affine(2.0, 0.0)?,
        output: eye,
    };
    let mha = MultiHeadAttention::from_weights(config, weights, None)?;
    let queries = Tensor::randn(0f32, 1.0, (1, 3, 4), &device)?;
    let memory = Tensor::from_vec(vec![1f32, -2.0, 3.0, 0.5], (1, 1, 4), &device)?;
    let out = mha.forward(&queries, &memory, &memory, None, None)?;

    let expected = memory.affine(2.0, 0.0)?.broadcast_as((1, 3, 4))?;
    assert!(max_abs_diff(&out, &expected) < 1e-6);
    Ok(())
}

#[test]
fn padding_mask_hides_padded_keys() -> Result<()> {
    let device = Device::Cpu;
    let mha = MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS),
        None,
        &device,
        DType::F32,
    )?;
    let x = Tensor::randn(0f32, 1.0, (2, 4, DEPTH), &device)?;
    let mask = padding_mask_from_lengths(&device, &[2, 4], 4)?;
    mha.forward(&x, &x, &x, Some(&mask), None)?;

    let weights = mha.last_attention_weights().expect("weights recorded");
    let first = weights.narrow(0, 0, 1)?.narrow(3, 2, 2)?;
    assert_eq!(first.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
    let second = weights.narrow(0, 1, 1)?.narrow(3, 2, 2)?;
    assert!(second.max_all()?.to_vec0::<f32>()? > 0.0);
    Ok(())
}

#[test]
fn fully_masked_rows_stay_finite() -> Result<()> {
    let device = Device::Cpu;
    let mha = self_attention(8)?;
    mha.set_training(false);
    let x = Tensor::randn(0f32, 1.0, (2, 4, DEPTH), &device)?;
    // Batch 0 is all padding; query 0 of batch 1 only sees its padded key.
    let mask = padding_mask_from_booleans(
        &device,
        &[vec![true; 4], vec![true, false, false, false]],
    )?;
    let out = mha.forward(&x, &x, &x, Some(&mask), None)?;
    let out = out.flatten_all()?.to_vec1::<f32>()?;
    assert!(out.iter().all(|v| v.is_finite()));

    let weights = mha.last_attention_weights().expect("weights recorded");
    let flat = weights.flatten_all()?.to_vec1::<f32>()?;
    assert!(flat.iter().all(|v| v.is_finite()));
    assert!(row_sums(&weights).iter().all(|s| (s - 1.0).abs() < 1e-5));

    let empty = padding_mask_from_lengths(&device, &[0, 4], 4)?;
    let out = mha.forward(&x, &x, &x, Some(&empty), None)?;
    assert!(out.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn failed_call_leaves_cache_untouched() -> Result<()> {
    let mha = self_attention(8)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, DEPTH), &Device::Cpu)?;
    let bad_mask = Tensor::zeros((1, 3, 3, 3), DType::F32, &Device::Cpu)?;
    let mut cache = LayerCache::new();
    let err = mha
        .forward(&x, &x, &x, Some(&bad_mask), Some(&mut cache))
        .unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));
    assert!(cache.is_empty());
    Ok(())
}

#[test]
fn keys_beyond_bias_mask_are_rejected() -> Result<()> {
    let mha = self_attention(4)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, DEPTH), &Device::Cpu)?;
    let mut cache = LayerCache::new();
    mha.forward(&x, &x, &x, None, Some(&mut cache))?;
    let err = mha
        .forward(&x, &x, &x, None, Some(&mut cache))
        .unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));
    assert_eq!(cache.seq_len(&AttentionKind::SelfAttention), Some(3));
    Ok(())
}

#[test]
fn wrong_query_depth_is_a_shape_error() -> Result<()> {
    let mha = self_attention(4)?;
    let x = Tensor::zeros((1, 2, DEPTH + 1), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        mha.forward(&x, &x, &x, None, None),
        Err(AttentionError::InvalidShape { .. })
    ));
    Ok(())
}

#[test]
fn dropout_only_applies_while_training() -> Result<()> {
    let device = Device::Cpu;
    let mha = MultiHeadAttention::new(
        AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS).with_dropout(0.5, 42),
        None,
        &device,
        DType::F32,
    )?;
    let x = Tensor::randn(0f32, 1.0, (2, 6, DEPTH), &device)?;

    mha.set_training(false);
    let a = mha.forward(&x, &x, &x, None, None)?;
    let b = mha.forward(&x, &x, &x, None, None)?;
    assert_eq!(max_abs_diff(&a, &b), 0.0);

    mha.set_training(true);
    let trained = mha.forward(&x, &x, &x, None, None)?;
    assert!(max_abs_diff(&a, &trained) > 0.0);
    let weights = mha.last_attention_weights().expect("weights recorded");
    assert!(row_sums(&weights).iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn reduced_precision_storage_stays_close_to_f32() -> Result<()> {
    let device = Device::Cpu;
    let config = AttentionConfig::new(DEPTH, DEPTH, DEPTH, HEADS);
    let weights = AttentionWeights::sample(&config, &LinearInit::XavierUniform, &device, DType::F32)?;
    let reference = MultiHeadAttention::from_weights(config.clone(), weights.clone(), None)?;
    let half = MultiHeadAttention::from_weights(
        config,
        AttentionWeights {
            query: weights.query.to_dtype(DType::BF16)?,
            key: weights.key.to_dtype(DType::BF16)?,
            value: weights.value.to_dtype(DType::BF16)?,
            output: weights.output.to_dtype(DType::BF16)?,
        },
        None,
    )?;
    let x = Tensor::randn(0f32, 1.0, (1, 4, DEPTH), &device)?;
    let expected = reference.forward(&x, &x, &x, None, None)?;
    let x_half = x.to_dtype(DType::BF16)?;
    let out = half.forward(&x_half, &x_half, &x_half, None, None)?;
    assert_eq!(out.dtype(), DType::BF16);
    assert!(max_abs_diff(&out.to_dtype(DType::F32)?, &expected) < 0.1);
    Ok(())
}
