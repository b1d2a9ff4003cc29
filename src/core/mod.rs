//! Core evaluation types and functionality.

pub mod error;
pub mod metrics;
pub mod model;
pub mod question;
pub mod store;

pub use error::EvalError;
pub use metrics::{attention_error, tensor_error};
pub use model::{ForwardOptions, ForwardOutput, LanguageModel, ModelGeometry, PastKeyValues};
pub use question::Question;
pub use store::{find_record, load_records, write_records, CacheRecord};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const EVALUATOR_VERSION: &str = "1";

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Bumped whenever the evaluation procedure changes; part of the fingerprint.
    pub version: String,
    pub draw_cache_insights: bool,
    pub show_progress: bool,
    pub cache_file: Option<PathBuf>,
    pub figs_dir: PathBuf,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            version: EVALUATOR_VERSION.to_string(),
            draw_cache_insights: false,
            show_progress: false,
            cache_file: None,
            figs_dir: PathBuf::from("figs"),
        }
    }
}

impl EvaluatorConfig {
    /// Defaults overridden by `KVQ_EVAL_*` environment variables.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };
        let defaults = Self::default();
        Self {
            version: std::env::var("KVQ_EVAL_VERSION").unwrap_or(defaults.version),
            draw_cache_insights: flag("KVQ_EVAL_INSIGHTS").unwrap_or(defaults.draw_cache_insights),
            show_progress: flag("KVQ_EVAL_PROGRESS").unwrap_or(defaults.show_progress),
            cache_file: std::env::var_os("KVQ_EVAL_CACHE_FILE")
                .map(PathBuf::from)
                .or(defaults.cache_file),
            figs_dir: std::env::var_os("KVQ_EVAL_FIGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.figs_dir),
        }
    }
}

/// Accuracy, fidelity and compression figures for one question or a corpus.
///
/// Fields serialize as plain JSON numbers when finite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(with = "store::json_f64")]
    pub accuracy: f64,
    /// Half-width of the 95% confidence interval on `accuracy`.
    #[serde(with = "store::json_f64")]
    pub accuracy_confidence: f64,
    #[serde(with = "store::json_f64")]
    pub answer_log_probability: f64,
    #[serde(with = "store::json_f64")]
    pub quantization_error: f64,
    #[serde(with = "store::json_f64")]
    pub key_quantization_error: f64,
    #[serde(with = "store::json_f64")]
    pub value_quantization_error: f64,
    #[serde(with = "store::json_f64")]
    pub attention_error: f64,
    #[serde(with = "store::json_f64")]
    pub logit_error: f64,
    #[serde(with = "store::json_f64")]
    pub average_n_bits: f64,
    #[serde(with = "store::json_f64")]
    pub key_average_n_bits: f64,
    #[serde(with = "store::json_f64")]
    pub value_average_n_bits: f64,
    /// Bytes per token.
    #[serde(with = "store::json_f64")]
    pub average_size: f64,
    #[serde(with = "store::json_f64")]
    pub key_average_size: f64,
    #[serde(with = "store::json_f64")]
    pub value_average_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_with_flat_field_names() {
        let result = EvaluationResult {
            accuracy: 0.5,
            key_average_size: 12.0,
            ..Default::default()
        };
        let value = serde_json::to_value(result).unwrap();
        assert_eq!(value["accuracy"], 0.5);
        assert_eq!(value["key_average_size"], 12.0);
        assert_eq!(value.as_object().unwrap().len(), 14);
        let back: EvaluationResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_non_finite_fields_serialize_as_strings() {
        let result = EvaluationResult {
            logit_error: f64::NAN,
            attention_error: f64::INFINITY,
            ..Default::default()
        };
        let value = serde_json::to_value(result).unwrap();
        assert_eq!(value["logit_error"], "NaN");
        assert_eq!(value["attention_error"], "Infinity");
        let back: EvaluationResult = serde_json::from_value(value).unwrap();
        assert!(back.logit_error.is_nan());
        assert_eq!(back.attention_error, f64::INFINITY);
    }

    #[test]
    fn test_config_from_env_overrides_defaults() {
        std::env::set_var("KVQ_EVAL_VERSION", "7");
        std::env::set_var("KVQ_EVAL_INSIGHTS", "TRUE");
        std::env::set_var("KVQ_EVAL_CACHE_FILE", "out/results.json");
        let config = EvaluatorConfig::from_env();
        std::env::remove_var("KVQ_EVAL_VERSION");
        std::env::remove_var("KVQ_EVAL_INSIGHTS");
        std::env::remove_var("KVQ_EVAL_CACHE_FILE");

        assert_eq!(config.version, "7");
        assert!(config.draw_cache_insights);
        assert!(!config.show_progress);
        assert_eq!(config.cache_file, Some(PathBuf::from("out/results.json")));
        assert_eq!(config.figs_dir, PathBuf::from("figs"));
    }
}
