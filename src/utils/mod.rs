//! Utility functions for cache statistics.

pub mod stats;
pub mod tensor_ops;

pub use stats::{histogram, mean, std_dev, DistributionSummary};
pub use tensor_ops::{cache_token_rows, cache_token_values};
