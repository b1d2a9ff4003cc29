//! Quantized-cache evaluation over a question corpus.

mod aggregate;
mod single;

pub use aggregate::{accuracy_confidence, CorpusAccumulator};
pub use single::select_choice;

use crate::core::{
    find_record, load_records, write_records, CacheRecord, EvalError, EvaluationResult,
    EvaluatorConfig, LanguageModel, Question,
};
use crate::insights::{check_token_level, CacheInsightRenderer, PngInsightRenderer};
use crate::strategies::KvQuantizer;
use anyhow::Result;
use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, warn};

pub struct Evaluator<M: LanguageModel> {
    device: Device,
    config: EvaluatorConfig,
    model: M,
    questions: Vec<Question>,
    key_quantizer: Box<dyn KvQuantizer>,
    value_quantizer: Box<dyn KvQuantizer>,
    renderer: Option<Box<dyn CacheInsightRenderer>>,
    params: Value,
}

impl<M: LanguageModel> Evaluator<M> {
    /// Fails when cache insights are requested for a quantizer that is not
    /// token-level.
    pub fn new(
        device: Device,
        config: EvaluatorConfig,
        model: M,
        questions: Vec<Question>,
        key_quantizer: Box<dyn KvQuantizer>,
        value_quantizer: Box<dyn KvQuantizer>,
    ) -> Result<Self> {
        let renderer: Option<Box<dyn CacheInsightRenderer>> = if config.draw_cache_insights {
            check_token_level(key_quantizer.granularity(), value_quantizer.granularity())?;
            Some(Box::new(PngInsightRenderer::new(config.figs_dir.clone())))
        } else {
            None
        };
        let params = json!({
            "version": config.version,
            "model_name": model.name(),
            "question_count": questions.len(),
            "key_quantizer": key_quantizer.params(),
            "value_quantizer": value_quantizer.params(),
        });
        Ok(Self {
            device,
            config,
            model,
            questions,
            key_quantizer,
            value_quantizer,
            renderer,
            params,
        })
    }

    /// Replace the renderer used for cache insights.
    pub fn with_renderer(mut self, renderer: Box<dyn CacheInsightRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Fingerprint identifying this evaluation in the result store.
    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn evaluate(&self, show_progress: bool) -> Result<EvaluationResult> {
        if self.questions.is_empty() {
            return Err(EvalError::EmptyCorpus("question list is empty".to_string()).into());
        }
        info!(
            model = self.model.name(),
            questions = self.questions.len(),
            key_quantizer = self.key_quantizer.name(),
            value_quantizer = self.value_quantizer.name(),
            "evaluating quantized cache"
        );

        let pb = if show_progress {
            let pb = ProgressBar::new(self.questions.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  Evaluate: [{bar:30}] {pos}/{len} ({eta})")?,
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut acc = CorpusAccumulator::new();
        for (idx, question) in self.questions.iter().enumerate() {
            let single = self.evaluate_single(idx, question)?;
            acc.add(&single, question.question_length());
            pb.inc(1);
        }
        pb.finish_and_clear();

        let result = acc.finish()?;
        info!(
            accuracy = result.accuracy,
            confidence = result.accuracy_confidence,
            logit_error = result.logit_error,
            average_n_bits = result.average_n_bits,
            "evaluation finished"
        );
        if !result.logit_error.is_finite() || !result.quantization_error.is_finite() {
            warn!("non-finite error metrics, quantized cache may contain NaN or inf");
        }
        Ok(result)
    }

    /// Evaluate, reusing a stored result with an identical fingerprint.
    ///
    /// On a miss the new record is appended and, when `cache_file` is given,
    /// the whole store is rewritten.
    pub fn cached_evaluate(
        &self,
        cache_file: Option<&Path>,
        show_progress: bool,
    ) -> Result<EvaluationResult> {
        let mut records = match cache_file {
            Some(path) => load_records(path)?,
            None => Vec::new(),
        };
        if let Some(record) = find_record(&records, &self.params) {
            info!(records = records.len(), "reusing cached evaluation result");
            return Ok(record.results);
        }

        let result = self.evaluate(show_progress)?;
        records.push(CacheRecord {
            params: self.params.clone(),
            results: result,
        });
        if let Some(path) = cache_file {
            write_records(path, &records)?;
            info!(path = %path.display(), records = records.len(), "stored evaluation result");
        }
        Ok(result)
    }

    /// [`Self::cached_evaluate`] with the store and progress settings from the config.
    pub fn run(&self) -> Result<EvaluationResult> {
        self.cached_evaluate(self.config.cache_file.as_deref(), self.config.show_progress)
    }

    fn draw_cache_insights(&self, caches: &[(&str, &Tensor)]) -> Result<()> {
        check_token_level(
            self.key_quantizer.granularity(),
            self.value_quantizer.granularity(),
        )?;
        if let Some(renderer) = &self.renderer {
            renderer.render(caches)?;
        }
        Ok(())
    }
}
