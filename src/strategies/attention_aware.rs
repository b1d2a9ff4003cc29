//! Mixed-precision quantization driven by how much attention each token receives.
//!
//! For every (layer, batch item) the prefix tokens are ranked by the attention
//! mass they receive, summed over heads and query positions. The top
//! `keep_ratio` fraction is stored at `high_bits`, the rest at `low_bits`.
//! Within a token each head vector is quantized uniformly.

use super::uniform::fake_quantize_groups;
use super::{
    cache_dims, check_bits, Granularity, KvQuantizer, QuantizedCache, GROUP_OVERHEAD_BITS,
};
use crate::core::EvalError;
use anyhow::Result;
use candle_core::{DType, Tensor};
use serde_json::{json, Value};

pub struct AttentionAwareQuantizer {
    high_bits: u32,
    low_bits: u32,
    keep_ratio: f64,
}

impl AttentionAwareQuantizer {
    pub fn new(high_bits: u32, low_bits: u32, keep_ratio: f64) -> Result<Self> {
        check_bits(high_bits)?;
        check_bits(low_bits)?;
        if !(0.0..=1.0).contains(&keep_ratio) {
            let msg = format!("keep ratio {keep_ratio} outside [0, 1]");
            return Err(EvalError::Quantizer(msg).into());
        }
        Ok(Self {
            high_bits,
            low_bits,
            keep_ratio,
        })
    }

    /// Attention mass received by each prefix token, indexed `[layer][batch][token]`.
    fn token_importance(attentions: &[Tensor]) -> Result<Vec<Vec<Vec<f32>>>> {
        attentions
            .iter()
            .map(|attn| -> Result<Vec<Vec<f32>>> {
                Ok(attn.to_dtype(DType::F32)?.sum(1)?.sum(1)?.to_vec2::<f32>()?)
            })
            .collect()
    }

    /// Number of tokens per row kept at high precision.
    fn kept_tokens(&self, seq_len: usize) -> usize {
        ((seq_len as f64 * self.keep_ratio).round() as usize).min(seq_len)
    }
}

impl KvQuantizer for AttentionAwareQuantizer {
    fn quantize(&self, cache: &Tensor, attentions: Option<&[Tensor]>) -> Result<QuantizedCache> {
        let (n_layer, n_batch, _, seq_len, head_dim) = cache_dims(cache)?;
        let attentions = attentions.ok_or_else(|| {
            EvalError::Quantizer("attention-aware quantization needs attention weights".to_string())
        })?;
        if attentions.len() != n_layer {
            let err = EvalError::length_mismatch("attention layers", attentions.len(), n_layer);
            return Err(err.into());
        }
        let importance = Self::token_importance(attentions)?;

        let keep = self.kept_tokens(seq_len);
        let mut mask = Vec::with_capacity(n_layer * n_batch * seq_len);
        for layer in &importance {
            if layer.len() != n_batch || layer.iter().any(|row| row.len() != seq_len) {
                return Err(EvalError::Quantizer(format!(
                    "attention weights do not cover a {n_batch}x{seq_len} prefix"
                ))
                .into());
            }
            for row in layer {
                let mut order: Vec<usize> = (0..seq_len).collect();
                order.sort_by(|&a, &b| {
                    row[b]
                        .partial_cmp(&row[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut flags = vec![0u8; seq_len];
                for &token in &order[..keep] {
                    flags[token] = 1;
                }
                mask.extend(flags);
            }
        }
        let mask = Tensor::from_vec(mask, (n_layer, n_batch, 1, seq_len, 1), cache.device())?
            .broadcast_as(cache.shape())?;

        let (high, _) = fake_quantize_groups(cache, self.high_bits)?;
        let (low, _) = fake_quantize_groups(cache, self.low_bits)?;
        let mixed = mask.where_cond(&high, &low)?.to_dtype(cache.dtype())?;

        let kept_fraction = if seq_len == 0 {
            0.0
        } else {
            keep as f64 / seq_len as f64
        };
        let average_n_bits = kept_fraction * self.high_bits as f64
            + (1.0 - kept_fraction) * self.low_bits as f64
            + GROUP_OVERHEAD_BITS / head_dim as f64;

        Ok(QuantizedCache {
            cache: mixed,
            average_n_bits,
        })
    }

    fn granularity(&self) -> Granularity {
        Granularity::Token
    }

    fn params(&self) -> Value {
        json!({
            "name": self.name(),
            "high_bits": self.high_bits,
            "low_bits": self.low_bits,
            "keep_ratio": self.keep_ratio,
            "level": self.granularity(),
        })
    }

    fn name(&self) -> &'static str {
        "attention_aware"
    }
}
