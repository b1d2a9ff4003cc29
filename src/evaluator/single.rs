//! Two-pass evaluation of one question.
//!
//! The first pass encodes prompt and choices at full precision. Its prompt
//! cache is quantized and the second pass continues from the quantized cache
//! over the choice tokens only, as if the prompt had been stored compressed.

use super::Evaluator;
use crate::core::{
    attention_error, tensor_error, EvalError, EvaluationResult, ForwardOptions, ForwardOutput,
    LanguageModel, PastKeyValues, Question,
};
use crate::strategies::{KvQuantizer, QuantizedCache};
use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::ops::log_softmax;
use tracing::debug;

/// Index of the highest score, the first one on ties.
pub fn select_choice(scores: &[f64]) -> usize {
    let mut best = 0;
    for (idx, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = idx;
        }
    }
    best
}

/// Attentions and cache of a forward pass, or a model error naming the pass.
fn unpack(output: ForwardOutput, pass: &str) -> Result<(Tensor, Vec<Tensor>, PastKeyValues)> {
    let attentions = output
        .attentions
        .ok_or_else(|| EvalError::Model(format!("{pass} pass returned no attentions")))?;
    let cache = output
        .past_key_values
        .ok_or_else(|| EvalError::Model(format!("{pass} pass returned no cache")))?;
    Ok((output.logits.detach(), attentions, cache))
}

/// Stack the first `len` positions of each layer into a 5-D cache.
fn stack_prefix<'a>(
    layers: impl Iterator<Item = &'a Tensor>,
    len: usize,
    device: &Device,
) -> Result<Tensor> {
    let layers = layers
        .map(|t| t.detach().narrow(2, 0, len)?.to_device(device))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&layers, 0)?)
}

fn quantize_checked(
    quantizer: &dyn KvQuantizer,
    cache: &Tensor,
    attentions: &[Tensor],
) -> Result<QuantizedCache> {
    let quantized = quantizer.quantize(cache, Some(attentions))?;
    if quantized.cache.dims() != cache.dims() {
        return Err(EvalError::shape_mismatch(
            format!("{} quantizer output", quantizer.name()),
            cache.dims(),
            quantized.cache.dims(),
        )
        .into());
    }
    Ok(quantized)
}

/// Key columns `[0, prefix)` of each attention tensor, after checking it has them.
fn prefix_columns(attentions: &[Tensor], prefix: usize) -> Result<Vec<Tensor>> {
    attentions
        .iter()
        .map(|attn| -> Result<Tensor> {
            let (_, _, _, n_keys) = attn.dims4()?;
            if n_keys < prefix {
                return Err(EvalError::shape_mismatch(
                    "quantized pass attention keys",
                    attn.dims(),
                    &[prefix],
                )
                .into());
            }
            Ok(attn.narrow(3, 0, prefix)?)
        })
        .collect()
}

/// Length-normalized log-probability of every choice under the quantized cache.
///
/// `first_log_probs` is `(choice, vocab)` from the last prompt position of the
/// full pass; `continuation_log_probs` is `(choice, position, vocab)` from the
/// quantized pass.
fn choice_scores(
    question: &Question,
    input_ids: &Tensor,
    first_log_probs: &Tensor,
    continuation_log_probs: &Tensor,
) -> Result<Vec<f64>> {
    let q_len = question.question_length();
    let mut scores = Vec::with_capacity(question.n_choices());
    for (choice, &len) in question.choice_length().iter().enumerate() {
        let first_token = input_ids.i((choice, q_len))?.to_scalar::<u32>()? as usize;
        let mut log_prob = first_log_probs
            .i((choice, first_token))?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        if len > 1 {
            let targets = input_ids
                .i((choice, q_len + 1..q_len + len))?
                .unsqueeze(1)?
                .contiguous()?;
            log_prob += continuation_log_probs
                .i((choice, ..len - 1))?
                .contiguous()?
                .gather(&targets, 1)?
                .to_dtype(DType::F64)?
                .sum_all()?
                .to_scalar::<f64>()?;
        }
        scores.push(log_prob / len as f64);
    }
    Ok(scores)
}

impl<M: LanguageModel> Evaluator<M> {
    pub(super) fn evaluate_single(
        &self,
        idx: usize,
        question: &Question,
    ) -> Result<EvaluationResult> {
        let q_len = question.question_length();
        let input_ids = question.input_ids().to_device(&self.device)?;
        let (_, seq_len) = input_ids.dims2()?;
        let n_continuation = seq_len - q_len;

        // Forward before quantization
        let full = self.model.forward(&input_ids, None, ForwardOptions::default())?;
        let (full_logits, full_attentions, full_cache) = unpack(full, "full")?;

        let question_attentions = full_attentions
            .iter()
            .map(|attn| {
                attn.detach()
                    .narrow(2, 0, q_len)?
                    .narrow(3, 0, q_len)?
                    .to_device(&self.device)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let key_cache = stack_prefix(full_cache.iter().map(|(k, _)| k), q_len, &self.device)?;
        let value_cache = stack_prefix(full_cache.iter().map(|(_, v)| v), q_len, &self.device)?;

        let quantized_key =
            quantize_checked(self.key_quantizer.as_ref(), &key_cache, &question_attentions)?;
        let quantized_value =
            quantize_checked(self.value_quantizer.as_ref(), &value_cache, &question_attentions)?;
        let n_layers = key_cache.dim(0)?;
        let prior: PastKeyValues = (0..n_layers)
            .map(|l| -> candle_core::Result<(Tensor, Tensor)> {
                Ok((quantized_key.cache.i(l)?, quantized_value.cache.i(l)?))
            })
            .collect::<candle_core::Result<_>>()?;

        if self.config.draw_cache_insights && idx == 0 {
            self.draw_cache_insights(&[
                ("Key cache", &key_cache),
                ("Quantized key cache", &quantized_key.cache),
                ("Value cache", &value_cache),
                ("Quantized value cache", &quantized_value.cache),
            ])?;
        }

        // Forward after quantization, continuing from the quantized prompt cache
        let continuation = input_ids.narrow(1, q_len, n_continuation)?;
        let quantized = self
            .model
            .forward(&continuation, Some(&prior), ForwardOptions::default())?;
        let (quantized_logits, quantized_attentions, _) = unpack(quantized, "quantized")?;

        let first_log_probs = log_softmax(
            &full_logits.i((.., q_len - 1))?.to_dtype(DType::F32)?,
            D::Minus1,
        )?;
        let continuation_log_probs =
            log_softmax(&quantized_logits.to_dtype(DType::F32)?, D::Minus1)?;
        let scores =
            choice_scores(question, &input_ids, &first_log_probs, &continuation_log_probs)?;
        let predicted = select_choice(&scores);
        let answer_log_probability = scores[question.answer_idx()];

        let key_quantization_error = tensor_error(&key_cache, &quantized_key.cache, &self.device)?;
        let value_quantization_error =
            tensor_error(&value_cache, &quantized_value.cache, &self.device)?;
        let continuation_to_prefix = full_attentions
            .iter()
            .map(|attn| attn.narrow(2, q_len, n_continuation)?.narrow(3, 0, q_len))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let attention_error = attention_error(
            &continuation_to_prefix,
            &prefix_columns(&quantized_attentions, q_len)?,
            &self.device,
        )?;
        let logit_error = tensor_error(
            &full_logits.narrow(1, q_len, n_continuation)?,
            &quantized_logits,
            &self.device,
        )?;

        let geometry = self.model.geometry();
        let key_average_n_bits = quantized_key.average_n_bits;
        let value_average_n_bits = quantized_value.average_n_bits;
        let key_average_size = self.key_quantizer.size_from_bits(key_average_n_bits, &geometry);
        let value_average_size = self
            .value_quantizer
            .size_from_bits(value_average_n_bits, &geometry);

        debug!(
            question = idx,
            predicted,
            answer = question.answer_idx(),
            answer_log_probability,
            key_quantization_error,
            value_quantization_error,
            attention_error,
            logit_error,
            "evaluated question"
        );

        Ok(EvaluationResult {
            accuracy: if predicted == question.answer_idx() { 1.0 } else { 0.0 },
            accuracy_confidence: 0.0,
            answer_log_probability,
            quantization_error: (key_quantization_error + value_quantization_error) / 2.0,
            key_quantization_error,
            value_quantization_error,
            attention_error,
            logit_error,
            average_n_bits: (key_average_n_bits + value_average_n_bits) / 2.0,
            key_average_n_bits,
            value_average_n_bits,
            average_size: (key_average_size + value_average_size) / 2.0,
            key_average_size,
            value_average_size,
        })
    }
}
