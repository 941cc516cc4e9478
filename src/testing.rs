//! Scripted doubles shared by the unit tests

use crate::client::{ConnectionClient, SendFailure};
use crate::errors::{ExportError, Result};
use crate::event::{Event, translate};
use crate::observer::Observer;
use crate::records::{LogBatch, LogRecord};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the next `publish` call on a mock should do.
#[derive(Debug, Clone)]
pub enum PlannedSend {
    All,
    Partial(usize),
    Fail { acked: usize, permanent: bool },
    Delay(Duration),
}

#[derive(Debug, Default)]
struct ScriptState {
    connect_attempts: usize,
    connects: usize,
    closes: usize,
    fail_connects: usize,
    fail_closes: usize,
    plans: VecDeque<PlannedSend>,
    rounds: Vec<usize>,
    sent: Vec<Event>,
    in_flight: usize,
}

/// Shared handle to a mock's behaviour and recorded history.
#[derive(Debug, Clone, Default)]
pub struct ClientScript {
    state: Arc<Mutex<ScriptState>>,
}

impl ClientScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, send: PlannedSend) {
        self.state.lock().unwrap().plans.push_back(send);
    }

    pub fn fail_connects(&self, count: usize) {
        self.state.lock().unwrap().fail_connects = count;
    }

    pub fn fail_closes(&self, count: usize) {
        self.state.lock().unwrap().fail_closes = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Slice length of every publish call, in call order.
    pub fn rounds(&self) -> Vec<usize> {
        self.state.lock().unwrap().rounds.clone()
    }

    /// Events the mock acknowledged, in order.
    pub fn sent(&self) -> Vec<Event> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }
}

pub struct MockClient {
    host: String,
    script: ClientScript,
    reconnect: bool,
}

impl MockClient {
    pub fn new(host: &str, script: ClientScript) -> Self {
        Self {
            host: host.to_string(),
            script,
            reconnect: true,
        }
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }
}

#[async_trait]
impl ConnectionClient for MockClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn supports_reconnect(&self) -> bool {
        self.reconnect
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.script.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ExportError::Transport(format!(
                "connection refused by {}",
                self.host
            )));
        }
        state.connects += 1;
        Ok(())
    }

    async fn publish(&mut self, events: &[Event]) -> std::result::Result<usize, SendFailure> {
        let plan = {
            let mut state = self.script.state.lock().unwrap();
            state.rounds.push(events.len());
            state.in_flight += 1;
            state.plans.pop_front().unwrap_or(PlannedSend::All)
        };

        let outcome = match plan {
            PlannedSend::All => Ok(events.len()),
            PlannedSend::Partial(n) => Ok(n.min(events.len())),
            PlannedSend::Fail { acked, permanent } => {
                let error = if permanent {
                    ExportError::Rejected("payload refused".to_string())
                } else {
                    ExportError::Transport("connection reset".to_string())
                };
                Err(SendFailure::new(acked.min(events.len()), error))
            }
            PlannedSend::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(events.len())
            }
        };

        let mut state = self.script.state.lock().unwrap();
        state.in_flight -= 1;
        let acked = match &outcome {
            Ok(n) => *n,
            Err(failure) => failure.acked,
        };
        state.sent.extend_from_slice(&events[..acked]);
        outcome
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.script.state.lock().unwrap();
        state.closes += 1;
        if state.fail_closes > 0 {
            state.fail_closes -= 1;
            return Err(ExportError::Transport(format!(
                "{} did not close cleanly",
                self.host
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObservedCall {
    NewBatch(usize),
    Latency,
    Acked(usize),
    Permanent(usize),
    Retryable(usize),
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    calls: Mutex<Vec<ObservedCall>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ObservedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acked_total(&self) -> usize {
        self.calls()
            .iter()
            .map(|c| match c {
                ObservedCall::Acked(n) => *n,
                _ => 0,
            })
            .sum()
    }

    fn record(&self, call: ObservedCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Observer for RecordingObserver {
    fn new_batch(&self, events: usize) {
        self.record(ObservedCall::NewBatch(events));
    }

    fn report_latency(&self, _latency: Duration) {
        self.record(ObservedCall::Latency);
    }

    fn acked_events(&self, events: usize) {
        self.record(ObservedCall::Acked(events));
    }

    fn permanent_errors(&self, events: usize) {
        self.record(ObservedCall::Permanent(events));
    }

    fn retryable_errors(&self, events: usize) {
        self.record(ObservedCall::Retryable(events));
    }
}

pub fn valid_record(seq: usize) -> LogRecord {
    LogRecord::new(json!({
        "@metadata": {"beat": "filebeat"},
        "message": format!("line {}", seq),
        "seq": seq
    }))
}

pub fn valid_batch(len: usize) -> LogBatch {
    LogBatch::new((0..len).map(valid_record).collect())
}

pub fn sample_events(len: usize) -> Vec<Event> {
    (0..len)
        .map(|i| translate(&valid_record(i)).unwrap())
        .collect()
}

/// `seq` field of each event, for order checks.
pub fn sequence_of(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| e.fields.get("seq").and_then(|v| v.as_u64()))
        .collect()
}
