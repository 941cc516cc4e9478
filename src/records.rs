//! Log record and batch types accepted by the exporter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One structured log record as received from upstream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub body: Value,
    pub observed_timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            observed_timestamp: Utc::now(),
        }
    }

    pub fn with_observed_timestamp(mut self, observed_timestamp: DateTime<Utc>) -> Self {
        self.observed_timestamp = observed_timestamp;
        self
    }
}

/// Ordered group of records submitted together.
///
/// The batch id survives when a failed batch's remainder is handed back, so a
/// resubmission can be traced to the original push.
#[derive(Clone, Debug, PartialEq)]
pub struct LogBatch {
    batch_id: String,
    records: Vec<LogRecord>,
}

impl LogBatch {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), records)
    }

    pub fn with_id(batch_id: impl Into<String>, records: Vec<LogRecord>) -> Self {
        Self {
            batch_id: batch_id.into(),
            records,
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl From<Vec<LogRecord>> for LogBatch {
    fn from(records: Vec<LogRecord>) -> Self {
        LogBatch::new(records)
    }
}
