//! Descriptive statistics over flat value slices.

use serde::Serialize;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with `ddof` degrees of freedom removed from the divisor.
pub fn std_dev(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - ddof) as f64).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistributionSummary {
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub std: f64,
    pub mean: f64,
}

impl DistributionSummary {
    pub fn from_values(values: &[f64]) -> Self {
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Self {
            min,
            max,
            std: std_dev(values, 0),
            mean: mean(values),
        }
    }
}

/// Counts of `values` in `bins` equal-width bins over `[lo, hi]`.
///
/// Values outside the range are dropped; `hi` itself lands in the last bin.
pub fn histogram(values: &[f64], bins: usize, lo: f64, hi: f64) -> Vec<u64> {
    let mut counts = vec![0u64; bins];
    if bins == 0 || hi <= lo {
        return counts;
    }
    let width = (hi - lo) / bins as f64;
    for &v in values {
        if !(lo..=hi).contains(&v) {
            continue;
        }
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    counts
}
