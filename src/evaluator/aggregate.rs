//! Corpus-level accumulation of per-question results.

use crate::core::{EvalError, EvaluationResult};
use anyhow::Result;

/// z-score of a two-sided 95% normal interval.
const Z_95: f64 = 1.96;

/// Half-width of the normal-approximation 95% interval for a binomial proportion.
pub fn accuracy_confidence(accuracy: f64, n_questions: usize) -> f64 {
    Z_95 * (accuracy * (1.0 - accuracy) / n_questions as f64).sqrt()
}

/// Running sums over questions.
///
/// Accuracy, log-probability and error fields are averaged per question.
/// Bit-width and size fields are averaged per prefix token, so long prompts
/// weigh more than short ones.
#[derive(Debug, Clone, Default)]
pub struct CorpusAccumulator {
    sum: EvaluationResult,
    n_questions: usize,
    n_tokens: usize,
}

impl CorpusAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, single: &EvaluationResult, n_tokens: usize) {
        let w = n_tokens as f64;
        let s = &mut self.sum;
        s.accuracy += single.accuracy;
        s.answer_log_probability += single.answer_log_probability;
        s.quantization_error += single.quantization_error;
        s.key_quantization_error += single.key_quantization_error;
        s.value_quantization_error += single.value_quantization_error;
        s.attention_error += single.attention_error;
        s.logit_error += single.logit_error;
        s.average_size += single.average_size * w;
        s.key_average_size += single.key_average_size * w;
        s.value_average_size += single.value_average_size * w;
        s.average_n_bits += single.average_n_bits * w;
        s.key_average_n_bits += single.key_average_n_bits * w;
        s.value_average_n_bits += single.value_average_n_bits * w;
        self.n_questions += 1;
        self.n_tokens += n_tokens;
    }

    pub fn n_questions(&self) -> usize {
        self.n_questions
    }

    pub fn finish(self) -> Result<EvaluationResult> {
        if self.n_questions == 0 {
            return Err(EvalError::EmptyCorpus("no questions evaluated".to_string()).into());
        }
        if self.n_tokens == 0 {
            return Err(EvalError::EmptyCorpus("no prefix tokens evaluated".to_string()).into());
        }
        let n = self.n_questions as f64;
        let tokens = self.n_tokens as f64;
        let s = self.sum;
        let accuracy = s.accuracy / n;
        Ok(EvaluationResult {
            accuracy,
            accuracy_confidence: accuracy_confidence(accuracy, self.n_questions),
            answer_log_probability: s.answer_log_probability / n,
            quantization_error: s.quantization_error / n,
            key_quantization_error: s.key_quantization_error / n,
            value_quantization_error: s.value_quantization_error / n,
            attention_error: s.attention_error / n,
            logit_error: s.logit_error / n,
            average_n_bits: s.average_n_bits / tokens,
            key_average_n_bits: s.key_average_n_bits / tokens,
            value_average_n_bits: s.value_average_n_bits / tokens,
            average_size: s.average_size / tokens,
            key_average_size: s.key_average_size / tokens,
            value_average_size: s.value_average_size / tokens,
        })
    }
}
