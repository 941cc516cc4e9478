//! JSON document encoding for outgoing events

use crate::errors::Result;
use crate::event::{BEAT_MARKER, Event, METADATA_FIELD, TIMESTAMP_FIELD};
use chrono::SecondsFormat;
use serde_json::{Map, Value};

const DEFAULT_DOC_TYPE: &str = "_doc";

#[derive(Debug, Clone)]
pub struct EventEncoder {
    index: Option<String>,
    version: String,
    escape_html: bool,
}

impl EventEncoder {
    pub fn new(index: Option<String>, escape_html: bool) -> Self {
        Self {
            index,
            version: env!("CARGO_PKG_VERSION").to_string(),
            escape_html,
        }
    }

    pub fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        let mut doc = event.fields.clone();
        doc.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(
                event
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        );
        doc.insert(
            METADATA_FIELD.to_string(),
            Value::Object(self.metadata(&event.metadata)),
        );

        let bytes = serde_json::to_vec(&Value::Object(doc))?;
        if self.escape_html {
            Ok(escape_html(&bytes))
        } else {
            Ok(bytes)
        }
    }

    fn metadata(&self, source: &Map<String, Value>) -> Map<String, Value> {
        let mut metadata = source.clone();
        metadata
            .entry("type")
            .or_insert_with(|| Value::String(DEFAULT_DOC_TYPE.to_string()));
        metadata
            .entry("version")
            .or_insert_with(|| Value::String(self.version.clone()));
        if let Some(index) = &self.index {
            metadata.insert(BEAT_MARKER.to_string(), Value::String(index.clone()));
        }
        metadata
    }
}

/// `<`, `>` and `&` only ever appear inside JSON strings, so they can be
/// rewritten byte-wise without touching structure.
fn escape_html(json: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(json.len());
    for &b in json {
        match b {
            b'<' => out.extend_from_slice(b"\\u003c"),
            b'>' => out.extend_from_slice(b"\\u003e"),
            b'&' => out.extend_from_slice(b"\\u0026"),
            _ => out.push(b),
        }
    }
    out
}
