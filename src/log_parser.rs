//! Parsing of tailed log lines into exportable records

use crate::errors::{ExportError, Result};
use crate::event::{BEAT_MARKER, METADATA_FIELD};
use crate::records::LogRecord;
use serde_json::{Value, json};

/// Turns one log line into a record. `Ok(None)` skips the line.
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Result<Option<LogRecord>>;
}

/// Lines that are already JSON documents, shipped as-is
pub struct JsonLineParser;

impl LineParser for JsonLineParser {
    fn parse(&self, line: &str) -> Result<Option<LogRecord>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let body: Value = serde_json::from_str(line)
            .map_err(|e| ExportError::LogParse(format!("invalid JSON line: {}", e)))?;
        Ok(Some(LogRecord::new(body)))
    }
}

/// Free text lines wrapped as `{"message": line}` and stamped with a beat marker
pub struct PlainLineParser {
    beat: String,
}

impl PlainLineParser {
    pub fn new(beat: &str) -> Self {
        Self {
            beat: beat.to_string(),
        }
    }
}

impl LineParser for PlainLineParser {
    fn parse(&self, line: &str) -> Result<Option<LogRecord>> {
        let message = line.trim_end_matches(['\r', '\n']);
        if message.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(LogRecord::new(json!({
            "message": message,
            METADATA_FIELD: { BEAT_MARKER: self.beat },
        }))))
    }
}

/// Beats-shaped JSON passes through, everything else is treated as plain text
pub struct AutoLineParser {
    plain: PlainLineParser,
}

impl AutoLineParser {
    pub fn new(beat: &str) -> Self {
        Self {
            plain: PlainLineParser::new(beat),
        }
    }
}

impl LineParser for AutoLineParser {
    fn parse(&self, line: &str) -> Result<Option<LogRecord>> {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(body @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
                if body.get(METADATA_FIELD).is_some_and(Value::is_object) {
                    return Ok(Some(LogRecord::new(body)));
                }
            }
        }

        self.plain.parse(line)
    }
}

/// Factory for line parsers
pub struct ParserFactory;

impl ParserFactory {
    pub fn create(format: &str, beat: &str) -> Box<dyn LineParser> {
        match format.to_lowercase().as_str() {
            "json" => Box::new(JsonLineParser),
            "plain" => Box::new(PlainLineParser::new(beat)),
            _ => Box::new(AutoLineParser::new(beat)),
        }
    }
}
