//! Key/value cache quantization strategies.

pub mod attention_aware;
pub mod passthrough;
pub mod q8k;
pub mod uniform;

pub use attention_aware::AttentionAwareQuantizer;
pub use passthrough::PassthroughQuantizer;
pub use q8k::Q8KQuantizer;
pub use uniform::UniformQuantizer;

use crate::core::{EvalError, ModelGeometry};
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::mem;

/// Bits of metadata per quantization group: an f16 scale and an f16 minimum.
pub const GROUP_OVERHEAD_BITS: f64 = (2 * mem::size_of::<half::f16>() * 8) as f64;

/// Unit over which a quantizer makes one quantization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Each token's vectors are quantized independently.
    Token,
    /// One set of statistics per layer.
    Layer,
}

#[derive(Debug, Clone)]
pub enum QuantizerType {
    Passthrough,
    Uniform {
        n_bits: u32,
        granularity: Granularity,
    },
    AttentionAware {
        high_bits: u32,
        low_bits: u32,
        keep_ratio: f64,
    },
    Q8K,
}

/// A quantized cache and the bit-width actually spent on it.
#[derive(Debug, Clone)]
pub struct QuantizedCache {
    /// Dequantized values, same shape and dtype as the input cache.
    pub cache: Tensor,
    pub average_n_bits: f64,
}

pub trait KvQuantizer {
    /// Quantize a `(layer, batch, head, position, head_dim)` cache.
    ///
    /// `attentions` holds the prefix attention weights of each layer for
    /// quantizers that weigh tokens by importance.
    fn quantize(&self, cache: &Tensor, attentions: Option<&[Tensor]>) -> Result<QuantizedCache>;

    /// Bytes stored per token for one of key or value.
    fn size_from_bits(&self, average_n_bits: f64, geometry: &ModelGeometry) -> f64 {
        average_n_bits * geometry.elements_per_token() as f64 / 8.0
    }

    fn granularity(&self) -> Granularity;

    /// Configuration mapping, part of the evaluation fingerprint.
    fn params(&self) -> Value;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

pub fn create_quantizer(quantizer_type: &QuantizerType) -> Result<Box<dyn KvQuantizer>> {
    Ok(match *quantizer_type {
        QuantizerType::Passthrough => Box::new(PassthroughQuantizer::new()),
        QuantizerType::Uniform {
            n_bits,
            granularity,
        } => Box::new(UniformQuantizer::new(n_bits, granularity)?),
        QuantizerType::AttentionAware {
            high_bits,
            low_bits,
            keep_ratio,
        } => Box::new(AttentionAwareQuantizer::new(high_bits, low_bits, keep_ratio)?),
        QuantizerType::Q8K => Box::new(Q8KQuantizer::new()),
    })
}

/// Dimensions of a 5-D cache tensor.
pub(crate) fn cache_dims(cache: &Tensor) -> Result<(usize, usize, usize, usize, usize)> {
    cache.dims5().map_err(|_| {
        EvalError::Quantizer(format!(
            "expected a (layer, batch, head, position, head_dim) cache, got {:?}",
            cache.dims()
        ))
        .into()
    })
}

pub(crate) fn check_bits(n_bits: u32) -> Result<()> {
    if !(1..=8).contains(&n_bits) {
        return Err(EvalError::Quantizer(format!("unsupported bit width {n_bits}")).into());
    }
    Ok(())
}
