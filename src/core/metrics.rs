//! Mean-squared error between paired tensors.

use super::error::EvalError;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Move `t` onto `device` and promote it to a dtype wide enough to accumulate in.
fn to_compute(t: &Tensor, device: &Device) -> Result<Tensor> {
    let t = t.to_device(device)?;
    let t = match t.dtype() {
        DType::F64 => t,
        _ => t.to_dtype(DType::F32)?,
    };
    Ok(t)
}

/// Mean of the squared elementwise difference of two same-shaped tensors.
pub fn tensor_error(a: &Tensor, b: &Tensor, device: &Device) -> Result<f64> {
    if a.dims() != b.dims() {
        return Err(EvalError::shape_mismatch("tensor error", a.dims(), b.dims()).into());
    }
    let a = to_compute(a, device)?;
    let mut b = to_compute(b, device)?;
    if b.dtype() != a.dtype() {
        b = b.to_dtype(a.dtype())?;
    }
    let mse = (a - b)?
        .sqr()?
        .mean_all()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok(mse)
}

/// Layer-averaged [`tensor_error`] over two attention collections.
pub fn attention_error(a: &[Tensor], b: &[Tensor], device: &Device) -> Result<f64> {
    if a.len() != b.len() || a.is_empty() {
        return Err(EvalError::length_mismatch("attention error", a.len(), b.len()).into());
    }
    let mut total = 0.0;
    for (attn_a, attn_b) in a.iter().zip(b.iter()) {
        total += tensor_error(attn_a, attn_b, device)?;
    }
    Ok(total / a.len() as f64)
}
