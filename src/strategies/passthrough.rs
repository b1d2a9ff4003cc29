//! Unquantized baseline.

use super::{cache_dims, Granularity, KvQuantizer, QuantizedCache};
use anyhow::Result;
use candle_core::Tensor;
use serde_json::{json, Value};

pub struct PassthroughQuantizer;

impl PassthroughQuantizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PassthroughQuantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl KvQuantizer for PassthroughQuantizer {
    fn quantize(&self, cache: &Tensor, _attentions: Option<&[Tensor]>) -> Result<QuantizedCache> {
        cache_dims(cache)?;
        Ok(QuantizedCache {
            cache: cache.clone(),
            average_n_bits: (cache.dtype().size_in_bytes() * 8) as f64,
        })
    }

    fn granularity(&self) -> Granularity {
        Granularity::Token
    }

    fn params(&self) -> Value {
        json!({ "name": self.name() })
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}
