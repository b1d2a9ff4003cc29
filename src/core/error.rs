//! Error types for evaluation failures.
//!
//! Functions in this crate return `anyhow::Result`; the variants below are the
//! failure classes callers may want to tell apart, recoverable through
//! `err.downcast_ref::<EvalError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// Malformed question record
    #[error("Invalid question: {0}")]
    InvalidQuestion(String),

    /// Paired tensors with different shapes
    #[error("Shape mismatch in {context}: {left:?} vs {right:?}")]
    ShapeMismatch {
        context: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    /// Paired tensor sequences with different lengths
    #[error("Length mismatch in {context}: {left} vs {right}")]
    LengthMismatch {
        context: String,
        left: usize,
        right: usize,
    },

    /// Model collaborator broke its contract
    #[error("Model error: {0}")]
    Model(String),

    /// Quantizer collaborator broke its contract or was misconfigured
    #[error("Quantizer error: {0}")]
    Quantizer(String),

    /// Configuration precondition not met
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Aggregation over zero questions or zero tokens
    #[error("Empty corpus: {0}")]
    EmptyCorpus(String),

    /// Unreadable or malformed result store
    #[error("Cache store error: {0}")]
    CacheStore(String),
}

impl EvalError {
    pub fn shape_mismatch(context: impl Into<String>, left: &[usize], right: &[usize]) -> Self {
        EvalError::ShapeMismatch {
            context: context.into(),
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }

    pub fn length_mismatch(context: impl Into<String>, left: usize, right: usize) -> Self {
        EvalError::LengthMismatch {
            context: context.into(),
            left,
            right,
        }
    }
}
