//! Translation of log records into transport-ready events

use crate::errors::{ExportError, Result};
use crate::records::LogRecord;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub const METADATA_FIELD: &str = "@metadata";
pub const TIMESTAMP_FIELD: &str = "@timestamp";

/// Metadata key every shippable record must carry.
pub const BEAT_MARKER: &str = "beat";

/// A record split into the parts the remote expects.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub fields: Map<String, Value>,
}

/// Convert a record into an event.
///
/// Fails with [`ExportError::InvalidRecord`] when the body is not a map or
/// the metadata lacks the beat marker. The record itself is left untouched.
pub fn translate(record: &LogRecord) -> Result<Event> {
    let Value::Object(body) = &record.body else {
        return Err(ExportError::InvalidRecord(
            "log record body is not a map".to_string(),
        ));
    };

    let mut fields = body.clone();

    let metadata = match extract_metadata(&mut fields) {
        Some(metadata) if metadata.contains_key(BEAT_MARKER) => metadata,
        _ => {
            return Err(ExportError::InvalidRecord(format!(
                "record {} has no '{}' marker",
                METADATA_FIELD, BEAT_MARKER
            )));
        }
    };

    let timestamp = extract_timestamp(&mut fields).unwrap_or(record.observed_timestamp);

    Ok(Event {
        timestamp,
        metadata,
        fields,
    })
}

/// Translate a run of records, stopping at the first invalid one.
pub fn translate_all(records: &[LogRecord]) -> Result<Vec<Event>> {
    records.iter().map(translate).collect()
}

/// Remove and return `@metadata` if it is a map. Anything else stays put.
pub fn extract_metadata(fields: &mut Map<String, Value>) -> Option<Map<String, Value>> {
    if !matches!(fields.get(METADATA_FIELD), Some(Value::Object(_))) {
        return None;
    }
    match fields.remove(METADATA_FIELD) {
        Some(Value::Object(metadata)) => Some(metadata),
        _ => None,
    }
}

/// Remove and return `@timestamp` if it is an integer epoch-millis value.
pub fn extract_timestamp(fields: &mut Map<String, Value>) -> Option<DateTime<Utc>> {
    let millis = fields.get(TIMESTAMP_FIELD)?.as_i64()?;
    let timestamp = DateTime::from_timestamp_millis(millis)?;
    fields.remove(TIMESTAMP_FIELD);
    Some(timestamp)
}
