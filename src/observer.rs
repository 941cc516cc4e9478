//! Publish-pipeline observation hooks and a counting implementation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Receives counts from the publish loop. Called concurrently from every
/// worker, so implementations must be cheap and thread-safe.
pub trait Observer: Send + Sync {
    fn new_batch(&self, events: usize);
    fn report_latency(&self, latency: Duration);
    fn acked_events(&self, events: usize);
    fn permanent_errors(&self, events: usize);
    fn retryable_errors(&self, events: usize);
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NilObserver;

impl Observer for NilObserver {
    fn new_batch(&self, _events: usize) {}
    fn report_latency(&self, _latency: Duration) {}
    fn acked_events(&self, _events: usize) {}
    fn permanent_errors(&self, _events: usize) {}
    fn retryable_errors(&self, _events: usize) {}
}

/// Lock-free counters for the export pipeline
#[derive(Debug, Default)]
pub struct ExportMetrics {
    batches: AtomicU64,
    events: AtomicU64,
    rounds: AtomicU64,
    acked: AtomicU64,
    permanent: AtomicU64,
    retryable: AtomicU64,
    total_latency_us: AtomicU64,
    latency_bounds: Mutex<Option<(Duration, Duration)>>,
}

impl ExportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ExportMetricsSnapshot {
        let batches = self.batches.load(Ordering::Relaxed);
        let events = self.events.load(Ordering::Relaxed);
        let rounds = self.rounds.load(Ordering::Relaxed);
        let acked = self.acked.load(Ordering::Relaxed);
        let permanent = self.permanent.load(Ordering::Relaxed);
        let retryable = self.retryable.load(Ordering::Relaxed);
        let total_latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let bounds = *self
            .latency_bounds
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let ack_rate = if events > 0 {
            (acked as f64 / events as f64) * 100.0
        } else {
            0.0
        };

        let avg_latency_ms = if rounds > 0 {
            total_latency_us / rounds / 1000
        } else {
            0
        };

        ExportMetricsSnapshot {
            batches,
            events,
            rounds,
            acked_events: acked,
            permanent_errors: permanent,
            retryable_errors: retryable,
            ack_rate,
            avg_latency_ms,
            min_latency_ms: bounds.map(|(min, _)| min.as_millis() as u64),
            max_latency_ms: bounds.map(|(_, max)| max.as_millis() as u64),
        }
    }

    pub fn reset(&self) {
        self.batches.store(0, Ordering::Relaxed);
        self.events.store(0, Ordering::Relaxed);
        self.rounds.store(0, Ordering::Relaxed);
        self.acked.store(0, Ordering::Relaxed);
        self.permanent.store(0, Ordering::Relaxed);
        self.retryable.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        *self
            .latency_bounds
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Observer for ExportMetrics {
    fn new_batch(&self, events: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn report_latency(&self, latency: Duration) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);

        let mut bounds = self
            .latency_bounds
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *bounds = Some(match *bounds {
            Some((min, max)) => (min.min(latency), max.max(latency)),
            None => (latency, latency),
        });
    }

    fn acked_events(&self, events: usize) {
        self.acked.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn permanent_errors(&self, events: usize) {
        self.permanent.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn retryable_errors(&self, events: usize) {
        self.retryable.fetch_add(events as u64, Ordering::Relaxed);
    }
}

/// Snapshot of export metrics
#[derive(Debug, Clone, PartialEq)]
pub struct ExportMetricsSnapshot {
    pub batches: u64,
    pub events: u64,
    pub rounds: u64,
    pub acked_events: u64,
    pub permanent_errors: u64,
    pub retryable_errors: u64,
    pub ack_rate: f64,
    pub avg_latency_ms: u64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
}
