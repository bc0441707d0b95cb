//! Normalization of raw source records into the common bronze row shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DatasetRule;

pub const UNKNOWN_DATASET: &str = "unknown";

const EVENT_TIME_KEYS: &[&str] = &["event_time", "timestamp"];
const ENTITY_KEYS: &[&str] = &["entity_id", "user_id", "id"];
const METRIC_KEYS: &[&str] = &["metric", "event", "type"];
const VALUE_KEYS: &[&str] = &["value", "amount"];

/// One source record in the common tuple shape. Fields stay as raw text;
/// typing happens in the cleaning stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRow {
    pub dataset_id: String,
    pub event_time: Option<String>,
    pub entity_id: Option<String>,
    pub metric: Option<String>,
    pub value: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RowParseError {
    #[error("malformed JSON line: {0}")]
    MalformedJson(String),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record carries none of event_time, entity_id, metric, value")]
    EmptyRecord,
    #[error("unreadable record: {0}")]
    Unreadable(String),
}

/// Parses one JSONL line.
///
/// # Errors
/// Returns [`RowParseError`] when the line is not a JSON object or has no
/// usable fields.
pub fn parse_jsonl_line(
    line: &str,
    source_file: &str,
    rules: &[DatasetRule],
) -> Result<RawRow, RowParseError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| RowParseError::MalformedJson(err.to_string()))?;
    let Value::Object(record) = value else {
        return Err(RowParseError::NotAnObject);
    };
    normalize_record(&record, source_file, rules)
}

/// Maps a decoded record (JSON object or CSV row keyed by lowercase header)
/// onto [`RawRow`].
///
/// # Errors
/// Returns [`RowParseError::EmptyRecord`] when none of the four core fields
/// is present.
pub fn normalize_record(
    record: &Map<String, Value>,
    source_file: &str,
    rules: &[DatasetRule],
) -> Result<RawRow, RowParseError> {
    let event_time = pick_text(record, EVENT_TIME_KEYS);
    let entity_id = pick_text(record, ENTITY_KEYS);
    let metric = pick_text(record, METRIC_KEYS);
    let value = pick_text(record, VALUE_KEYS);

    if event_time.is_none() && entity_id.is_none() && metric.is_none() && value.is_none() {
        return Err(RowParseError::EmptyRecord);
    }

    let payload = normalize_payload(record.get("payload"));
    let explicit = pick_text(record, &["dataset_id"]);
    let dataset_id = resolve_dataset_id(explicit.as_deref(), &payload, source_file, rules);

    Ok(RawRow {
        dataset_id,
        event_time,
        entity_id,
        metric,
        value,
        payload,
    })
}

/// Resolves a dataset id: explicit field, then payload field, then the
/// first rule whose filename pattern occurs in the file name.
#[must_use]
pub fn resolve_dataset_id(
    explicit: Option<&str>,
    payload: &Value,
    source_file: &str,
    rules: &[DatasetRule],
) -> String {
    if let Some(value) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
        return value.to_string();
    }

    if let Some(value) = payload
        .get("dataset_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return value.to_string();
    }

    infer_dataset_from_filename(source_file, rules)
        .unwrap_or_else(|| UNKNOWN_DATASET.to_string())
}

#[must_use]
pub fn infer_dataset_from_filename(source_file: &str, rules: &[DatasetRule]) -> Option<String> {
    let file_name = std::path::Path::new(source_file)
        .file_name()
        .map_or_else(|| source_file.to_string(), |name| name.to_string_lossy().into_owned())
        .to_ascii_lowercase();

    rules
        .iter()
        .find(|rule| {
            rule.filename_patterns
                .iter()
                .any(|pattern| !pattern.is_empty() && file_name.contains(&pattern.to_ascii_lowercase()))
        })
        .map(|rule| rule.dataset_id.clone())
}

#[must_use]
pub fn infer_dataset_from_metric(metric: &str, rules: &[DatasetRule]) -> Option<String> {
    rules
        .iter()
        .find(|rule| rule.metrics.iter().any(|known| known == metric))
        .map(|rule| rule.dataset_id.clone())
}

fn pick_text(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find_map(value_as_text)
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        other => Some(other.to_string()),
    }
}

fn normalize_payload(raw: Option<&Value>) -> Value {
    match raw {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(text)) if text.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(text)) => serde_json::from_str::<Value>(text).unwrap_or_else(|_| {
            let mut wrapped = Map::new();
            wrapped.insert("_raw".to_string(), Value::String(text.clone()));
            Value::Object(wrapped)
        }),
        Some(other) => other.clone(),
    }
}
