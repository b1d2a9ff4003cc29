//! Tensor extraction helpers.

use anyhow::{bail, Result};
use candle_core::{DType, IndexOp, Tensor};

/// Values of one batch item of a 5-D cache, grouped by token position.
///
/// Row `t` holds every (layer, head, dim) value at position `t`.
pub fn cache_token_rows(cache: &Tensor, batch: usize) -> Result<Vec<Vec<f64>>> {
    let (n_layer, n_batch, n_head, seq_len, head_dim) = cache.dims5()?;
    if batch >= n_batch {
        bail!("batch item {batch} out of range for {n_batch}");
    }
    let rows = cache
        .i((.., batch))?
        .to_dtype(DType::F64)?
        .permute((2, 0, 1, 3))?
        .contiguous()?
        .reshape((seq_len, n_layer * n_head * head_dim))?
        .to_vec2::<f64>()?;
    Ok(rows)
}

/// Every (layer, head, dim) value at one position of one batch item.
pub fn cache_token_values(cache: &Tensor, batch: usize, position: usize) -> Result<Vec<f64>> {
    let (_, n_batch, _, seq_len, _) = cache.dims5()?;
    if batch >= n_batch || position >= seq_len {
        bail!("position ({batch}, {position}) out of range for {n_batch}x{seq_len} cache");
    }
    let values = cache
        .i((.., batch, .., position))?
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1::<f64>()?;
    Ok(values)
}
