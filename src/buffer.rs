//! In-memory buffering for log records awaiting export

use crate::records::{LogBatch, LogRecord};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Thread-safe bounded buffer of log records
#[derive(Debug, Clone)]
pub struct RecordBuffer {
    records: Arc<RwLock<VecDeque<LogRecord>>>,
    max_size: usize,
    batch_size: usize,
}

impl RecordBuffer {
    pub fn new(max_size: usize, batch_size: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_size: max_size.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Add a record, dropping the oldest one when full
    pub async fn add(&self, record: LogRecord) {
        let mut records = self.records.write().await;

        if records.len() >= self.max_size {
            records.pop_front();
            warn!("Record buffer overflow, dropping oldest entry");
        }

        records.push_back(record);
    }

    /// Take up to one batch worth of records from the front
    pub async fn drain_batch(&self) -> Option<LogBatch> {
        let records: Vec<LogRecord> = {
            let mut buffer = self.records.write().await;
            let count = self.batch_size.min(buffer.len());
            if count == 0 {
                return None;
            }
            buffer.drain(..count).collect()
        };

        debug!("Drained batch of {} records", records.len());
        Some(LogBatch::new(records))
    }

    /// Drain everything as a sequence of batches
    pub async fn flush_all(&self) -> Vec<LogBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = self.drain_batch().await {
            batches.push(batch);
        }
        debug!("Flushed {} batches from buffer", batches.len());
        batches
    }

    /// Put an unsent remainder back at the front, keeping its order. Records
    /// beyond capacity are dropped from the newest end.
    pub async fn requeue(&self, batch: LogBatch) {
        let mut records = self.records.write().await;
        for record in batch.into_records().into_iter().rev() {
            records.push_front(record);
        }

        if records.len() > self.max_size {
            let dropped = records.len() - self.max_size;
            records.truncate(self.max_size);
            warn!("Record buffer overflow on requeue, dropped {} newest entries", dropped);
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn has_data(&self) -> bool {
        !self.is_empty().await
    }

    /// Buffer utilization as a percentage
    pub async fn utilization(&self) -> f64 {
        (self.len().await as f64 / self.max_size as f64) * 100.0
    }
}
