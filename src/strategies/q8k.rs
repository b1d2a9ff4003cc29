//! Token-level Q8K quantization using candle's k-quant blocks.
//!
//! Each (layer, batch item, token) row holds every head's vector for that
//! token, so the row length is `heads * head_dim` and must be a multiple of
//! `QK_K`.

use super::{cache_dims, Granularity, KvQuantizer, QuantizedCache};
use crate::core::EvalError;
use anyhow::Result;
use candle_core::quantized::k_quants::{BlockQ8K, QK_K};
use candle_core::quantized::GgmlType;
use candle_core::{DType, Tensor};
use serde_json::{json, Value};
use std::mem;

pub struct Q8KQuantizer;

impl Q8KQuantizer {
    pub fn new() -> Self {
        Self
    }

    /// Storage cost of one value, including the per-block scale and sums.
    pub fn bits_per_value() -> f64 {
        (mem::size_of::<BlockQ8K>() * 8) as f64 / QK_K as f64
    }
}

impl Default for Q8KQuantizer {
    fn default() -> Self {
        Self::new()
    }
}

fn quantize_rows_q8k(rows: usize, k: usize, data: &[f32]) -> Result<Vec<BlockQ8K>> {
    let blocks_per_row = k / QK_K;
    let mut blocks = vec![BlockQ8K::zeros(); rows * blocks_per_row];
    for r in 0..rows {
        let row = &data[r * k..(r + 1) * k];
        let dst = &mut blocks[r * blocks_per_row..(r + 1) * blocks_per_row];
        BlockQ8K::from_float(row, dst)?;
    }
    Ok(blocks)
}

impl KvQuantizer for Q8KQuantizer {
    fn quantize(&self, cache: &Tensor, _attentions: Option<&[Tensor]>) -> Result<QuantizedCache> {
        let (n_layer, n_batch, n_head, seq_len, head_dim) = cache_dims(cache)?;
        let k = n_head * head_dim;
        if k % QK_K != 0 {
            return Err(EvalError::Quantizer(format!(
                "token row of {n_head}x{head_dim} values is not a multiple of {QK_K}"
            ))
            .into());
        }
        let rows = n_layer * n_batch * seq_len;

        // (layer, batch, token, head, dim) so that each token is one contiguous row
        let data = cache
            .to_dtype(DType::F32)?
            .permute((0, 1, 3, 2, 4))?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let blocks = quantize_rows_q8k(rows, k, &data)?;
        let mut restored = vec![0f32; rows * k];
        BlockQ8K::to_float(&blocks, &mut restored)?;

        let deq = Tensor::from_vec(
            restored,
            (n_layer, n_batch, seq_len, n_head, head_dim),
            cache.device(),
        )?
        .permute((0, 1, 3, 2, 4))?
        .contiguous()?
        .to_dtype(cache.dtype())?;

        Ok(QuantizedCache {
            cache: deq,
            average_n_bits: Self::bits_per_value(),
        })
    }

    fn granularity(&self) -> Granularity {
        Granularity::Token
    }

    fn params(&self) -> Value {
        json!({ "name": self.name(), "level": self.granularity() })
    }

    fn name(&self) -> &'static str {
        "q8k"
    }
}
