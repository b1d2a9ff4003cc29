//! Accuracy and fidelity evaluation of quantized key/value attention caches.
//!
//! A prompt is encoded at full precision, its key/value cache is quantized,
//! and the model continues from the quantized cache over each candidate
//! answer. Comparing both passes gives multiple-choice accuracy, cache,
//! attention and logit errors, and the bits and bytes spent per token.

pub mod core;
pub mod evaluator;
pub mod insights;
pub mod strategies;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{
    attention_error, tensor_error, CacheRecord, EvalError, EvaluationResult, EvaluatorConfig,
    ForwardOptions, ForwardOutput, LanguageModel, ModelGeometry, PastKeyValues, Question,
    EVALUATOR_VERSION,
};

pub use evaluator::{accuracy_confidence, select_choice, CorpusAccumulator, Evaluator};

pub use insights::{CacheInsight, CacheInsightRenderer, PngInsightRenderer};

pub use strategies::{
    create_quantizer, Granularity, KvQuantizer, QuantizedCache, QuantizerType,
};

use anyhow::Result;
use candle_core::Device;

/// Evaluate one key/value quantizer pair, reusing `config.cache_file` when set.
pub fn evaluate_quantization<M: LanguageModel>(
    device: Device,
    model: M,
    questions: Vec<Question>,
    key: &QuantizerType,
    value: &QuantizerType,
    config: EvaluatorConfig,
) -> Result<EvaluationResult> {
    let evaluator = Evaluator::new(
        device,
        config,
        model,
        questions,
        create_quantizer(key)?,
        create_quantizer(value)?,
    )?;
    evaluator.run()
}
