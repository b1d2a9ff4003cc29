//! Asymmetric min/max uniform quantization.

use super::{
    cache_dims, check_bits, Granularity, KvQuantizer, QuantizedCache, GROUP_OVERHEAD_BITS,
};
use anyhow::Result;
use candle_core::{DType, Tensor};
use serde_json::{json, Value};

pub struct UniformQuantizer {
    n_bits: u32,
    granularity: Granularity,
}

impl UniformQuantizer {
    pub fn new(n_bits: u32, granularity: Granularity) -> Result<Self> {
        check_bits(n_bits)?;
        Ok(Self {
            n_bits,
            granularity,
        })
    }

    pub fn n_bits(&self) -> u32 {
        self.n_bits
    }
}

/// Quantize then dequantize `groups` along its last dimension.
///
/// Returns the reconstructed values in f32 and the group size.
pub(crate) fn fake_quantize_groups(groups: &Tensor, n_bits: u32) -> Result<(Tensor, usize)> {
    let last = groups.rank() - 1;
    let group_size = groups.dim(last)?;
    let levels = ((1u32 << n_bits) - 1) as f64;

    let x = groups.to_dtype(DType::F32)?;
    let lo = x.min_keepdim(last)?;
    let hi = x.max_keepdim(last)?;
    let scale = (hi - &lo)?.affine(1.0 / levels, 0.0)?.maximum(f32::EPSILON)?;

    let q = x
        .broadcast_sub(&lo)?
        .broadcast_div(&scale)?
        .round()?
        .clamp(0f32, levels as f32)?;
    let deq = q.broadcast_mul(&scale)?.broadcast_add(&lo)?;
    Ok((deq, group_size))
}

impl KvQuantizer for UniformQuantizer {
    fn quantize(&self, cache: &Tensor, _attentions: Option<&[Tensor]>) -> Result<QuantizedCache> {
        let (n_layer, ..) = cache_dims(cache)?;
        let groups = match self.granularity {
            Granularity::Token => cache.clone(),
            Granularity::Layer => cache.reshape((n_layer, cache.elem_count() / n_layer))?,
        };
        let (deq, group_size) = fake_quantize_groups(&groups, self.n_bits)?;
        Ok(QuantizedCache {
            cache: deq.reshape(cache.shape())?.to_dtype(cache.dtype())?,
            average_n_bits: self.n_bits as f64 + GROUP_OVERHEAD_BITS / group_size as f64,
        })
    }

    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn params(&self) -> Value {
        json!({
            "name": self.name(),
            "n_bits": self.n_bits,
            "level": self.granularity,
        })
    }

    fn name(&self) -> &'static str {
        "uniform"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tensor_error;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn cache() -> Tensor {
        let shape = (2, 1, 2, 3, 4);
        let n = 2 * 2 * 3 * 4;
        let data: Vec<f32> = (0..n).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_token_level_bits_include_overhead() {
        let q = UniformQuantizer::new(4, Granularity::Token).unwrap();
        let out = q.quantize(&cache(), None).unwrap();
        assert_eq!(out.cache.dims(), cache().dims());
        assert_eq!(q.n_bits(), 4);
        assert_relative_eq!(out.average_n_bits, q.n_bits() as f64 + 32.0 / 4.0);
    }

    #[test]
    fn test_layer_level_groups_whole_layer() {
        let q = UniformQuantizer::new(2, Granularity::Layer).unwrap();
        let out = q.quantize(&cache(), None).unwrap();
        assert_relative_eq!(out.average_n_bits, 2.0 + 32.0 / 24.0);
    }

    #[test]
    fn test_more_bits_reduce_error() {
        let c = cache();
        let coarse = UniformQuantizer::new(2, Granularity::Token).unwrap();
        let fine = UniformQuantizer::new(8, Granularity::Token).unwrap();
        let e2 = tensor_error(&c, &coarse.quantize(&c, None).unwrap().cache, &Device::Cpu).unwrap();
        let e8 = tensor_error(&c, &fine.quantize(&c, None).unwrap().cache, &Device::Cpu).unwrap();
        assert!(e8 < e2);
        assert!(e8 < 1e-3);
    }

    #[test]
    fn test_constant_group_is_exact() {
        let c = Tensor::full(1.5f32, (1, 1, 1, 2, 4), &Device::Cpu).unwrap();
        let q = UniformQuantizer::new(3, Granularity::Token).unwrap();
        let out = q.quantize(&c, None).unwrap();
        assert_eq!(tensor_error(&c, &out.cache, &Device::Cpu).unwrap(), 0.0);
    }

    #[test]
    fn test_rejects_non_cache_tensor() {
        let q = UniformQuantizer::new(4, Granularity::Token).unwrap();
        let flat = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(q.quantize(&flat, None).is_err());
    }
}
