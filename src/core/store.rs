//! File I/O for the evaluation result store.
//!
//! The store is a JSON array of `{params, results}` records. It is read whole
//! and rewritten whole. Result floats round-trip exactly; NaN and infinities
//! are stored as the strings `"NaN"`, `"Infinity"` and `"-Infinity"`.

use super::error::EvalError;
use super::EvaluationResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub params: Value,
    pub results: EvaluationResult,
}

/// Load every record from `path`. A missing file is an empty store; a file
/// that cannot be parsed is an error.
pub fn load_records(path: &Path) -> Result<Vec<CacheRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let records = serde_json::from_slice::<Vec<CacheRecord>>(&bytes).map_err(|e| {
        EvalError::CacheStore(format!("malformed result store {}: {e}", path.display()))
    })?;
    Ok(records)
}

/// First record whose fingerprint equals `params`.
pub fn find_record<'a>(records: &'a [CacheRecord], params: &Value) -> Option<&'a CacheRecord> {
    records.iter().find(|record| &record.params == params)
}

/// Replace the store at `path` with `records`.
///
/// The records are written to a temporary file next to `path` and renamed over
/// it, so an interrupted write leaves the previous store intact.
pub fn write_records(path: &Path, records: &[CacheRecord]) -> Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary store in {}", dir.display()))?;
    {
        let mut w = BufWriter::new(tmp.as_file());
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut w, formatter);
        records.serialize(&mut ser)?;
        w.write_all(b"\n")?;
        w.flush()?;
    }
    tmp.persist(path)
        .map_err(|e| EvalError::CacheStore(format!("replacing {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Serde adapter for result floats that keeps non-finite values readable.
pub(crate) mod json_f64 {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(F64Visitor)
    }

    struct F64Visitor;

    impl<'de> Visitor<'de> for F64Visitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
            }
        }
    }
}
