//! Raw vs quantized cache diagnostics.
//!
//! Diagnostics look at one batch item of each cache and compare how values are
//! spread across token positions. They only make sense when every token was
//! quantized independently, so both quantizers must be token-level.

pub mod png;

pub use png::PngInsightRenderer;

use crate::core::EvalError;
use crate::strategies::Granularity;
use crate::utils::{cache_token_rows, cache_token_values, histogram, std_dev, DistributionSummary};
use anyhow::Result;
use candle_core::Tensor;

/// Position inspected for value distributions; position 0 holds the
/// beginning-of-sequence token.
pub const DISTRIBUTION_POSITION: usize = 1;
pub const HISTOGRAM_BINS: usize = 1000;
pub const HISTOGRAM_RANGE: (f64, f64) = (-5.0, 5.0);

pub trait CacheInsightRenderer {
    /// Render labelled caches, each `(layer, batch, head, position, head_dim)`.
    fn render(&self, caches: &[(&str, &Tensor)]) -> Result<()>;
}

pub fn check_token_level(key: Granularity, value: Granularity) -> Result<()> {
    for (role, granularity) in [("key", key), ("value", value)] {
        if granularity != Granularity::Token {
            return Err(EvalError::Precondition(format!(
                "cache insights need token-level quantization, {role} quantizer is {granularity:?}"
            ))
            .into());
        }
    }
    Ok(())
}

/// Statistics of one labelled cache, batch item 0.
#[derive(Debug, Clone)]
pub struct CacheInsight {
    pub label: String,
    /// Sample std over (layer, head, dim) at each position.
    pub token_std: Vec<f64>,
    /// Flattened values at [`DISTRIBUTION_POSITION`].
    pub distribution: Vec<f64>,
    pub summary: DistributionSummary,
}

impl CacheInsight {
    pub fn compute(label: &str, cache: &Tensor) -> Result<Self> {
        let token_std = cache_token_rows(cache, 0)?
            .iter()
            .map(|row| std_dev(row, 1))
            .collect();
        let distribution = cache_token_values(cache, 0, DISTRIBUTION_POSITION)?;
        let summary = DistributionSummary::from_values(&distribution);
        Ok(Self {
            label: label.to_string(),
            token_std,
            distribution,
            summary,
        })
    }

    pub fn histogram(&self) -> Vec<u64> {
        let (lo, hi) = HISTOGRAM_RANGE;
        histogram(&self.distribution, HISTOGRAM_BINS, lo, hi)
    }

    /// `label min max std mean`, as printed under the `(min/max/std/mean)` header.
    pub fn summary_line(&self) -> String {
        format!(
            "{:30} {:.4} {:.4} {:.4} {:.4}",
            self.label, self.summary.min, self.summary.max, self.summary.std, self.summary.mean
        )
    }
}
