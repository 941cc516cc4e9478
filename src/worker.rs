//! Per-connection worker: reconnect policy, TTL refresh and the windowed
//! publish loop

use crate::client::{BoxedClient, ConnectionClient, SendFailure};
use crate::config::{Backoff, Config};
use crate::errors::{ExportError, PublishError, Result};
use crate::event::translate_all;
use crate::observer::Observer;
use crate::queue::QueueReceiver;
use crate::records::{LogBatch, LogRecord};
use crate::window::Window;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type PublishResult = std::result::Result<(), PublishError>;

/// A batch handed to a worker together with the channel its outcome goes back on.
#[derive(Debug)]
pub struct WorkItem {
    pub batch: LogBatch,
    pub reply: oneshot::Sender<PublishResult>,
}

impl WorkItem {
    pub fn new(batch: LogBatch) -> (Self, oneshot::Receiver<PublishResult>) {
        let (reply, rx) = oneshot::channel();
        (Self { batch, reply }, rx)
    }
}

/// How a worker keeps its connection alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// The client manages itself; the worker only publishes.
    Disabled,
    /// Connect before publishing, reconnect after errors and when the TTL
    /// expires, with backoff between consecutive failed connects.
    Network {
        ttl: Option<Duration>,
        backoff: Backoff,
    },
}

impl ReconnectPolicy {
    pub fn for_client(client: &dyn ConnectionClient, config: &Config) -> Self {
        if !client.supports_reconnect() {
            return ReconnectPolicy::Disabled;
        }
        ReconnectPolicy::Network {
            ttl: (!config.ttl.is_zero()).then_some(config.ttl),
            backoff: config.backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Deadline one TTL after the last successful connect.
#[derive(Debug)]
struct TtlTicker {
    period: Duration,
    deadline: Instant,
}

impl TtlTicker {
    fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: Instant::now() + period,
        }
    }

    fn fired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn reset(&mut self) {
        self.deadline = Instant::now() + self.period;
    }
}

#[derive(Debug)]
struct ReconnectBackoff {
    init: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    fn new(bounds: Backoff) -> Self {
        Self {
            init: bounds.init,
            max: bounds.max,
            current: bounds.init,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.init;
    }
}

/// Per-worker publish settings
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub reconnect: ReconnectPolicy,
    /// Present when slow start is enabled
    pub window: Option<Window>,
    pub bulk_max_size: usize,
}

impl WorkerOptions {
    pub fn from_config(client: &dyn ConnectionClient, config: &Config) -> Self {
        let window = config.slow_start.then(|| {
            Window::new(
                config.slow_start_window,
                i32::try_from(config.bulk_max_size).unwrap_or(i32::MAX),
            )
        });
        Self {
            reconnect: ReconnectPolicy::for_client(client, config),
            window,
            bulk_max_size: config.bulk_max_size,
        }
    }
}

/// Handle to a spawned worker task
pub struct Worker {
    id: usize,
    host: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Worker {
    pub fn spawn(
        id: usize,
        client: BoxedClient,
        options: WorkerOptions,
        queue: QueueReceiver<WorkItem>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let host = client.host().to_string();
        let cancel = CancellationToken::new();
        let worker = WorkerLoop::new(id, client, options, observer, cancel.clone());
        let handle = tokio::spawn(worker.run(queue));

        Self {
            id,
            host,
            cancel,
            handle,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Ask the loop to stop after the batch it is working on.
    pub fn signal_close(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop, wait for it to exit and return its client close result.
    pub async fn close(self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ExportError::Other(format!(
                "worker {} for {} did not exit cleanly: {}",
                self.id, self.host, e
            ))),
        }
    }
}

/// State owned by one worker task.
struct WorkerLoop {
    id: usize,
    client: BoxedClient,
    reconnect: ReconnectPolicy,
    window: Option<Window>,
    bulk_max_size: usize,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
    state: ConnectionState,
    reconnect_attempts: u32,
    ticker: Option<TtlTicker>,
    backoff: ReconnectBackoff,
}

impl WorkerLoop {
    fn new(
        id: usize,
        client: BoxedClient,
        options: WorkerOptions,
        observer: Arc<dyn Observer>,
        cancel: CancellationToken,
    ) -> Self {
        let (ticker, backoff) = match options.reconnect {
            ReconnectPolicy::Network { ttl, backoff } => {
                (ttl.map(TtlTicker::new), ReconnectBackoff::new(backoff))
            }
            ReconnectPolicy::Disabled => (None, ReconnectBackoff::new(Backoff::default())),
        };

        Self {
            id,
            client,
            reconnect: options.reconnect,
            window: options.window,
            bulk_max_size: options.bulk_max_size.max(1),
            observer,
            cancel,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            ticker,
            backoff,
        }
    }

    async fn run(mut self, queue: QueueReceiver<WorkItem>) -> Result<()> {
        debug!("Worker {} started for {}", self.id, self.client.host());

        loop {
            let item = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let result = self.handle(item.batch).await;
            if item.reply.send(result).is_err() {
                debug!("Worker {}: caller stopped waiting for its result", self.id);
            }
        }

        // A handoff can complete just before the close signal wins the select
        while let Some(item) = queue.try_recv() {
            debug!(
                "Worker {}: rejecting batch {} handed off during shutdown",
                self.id,
                item.batch.batch_id()
            );
            let rejected = Err(PublishError::new(ExportError::ShuttingDown, item.batch));
            if item.reply.send(rejected).is_err() {
                debug!("Worker {}: caller stopped waiting for its result", self.id);
            }
        }

        drop(queue);
        self.ticker = None;
        debug!("Worker {} for {} stopping", self.id, self.client.host());
        self.client.close().await
    }

    async fn handle(&mut self, batch: LogBatch) -> PublishResult {
        let network = matches!(self.reconnect, ReconnectPolicy::Network { .. });
        if network && !self.refresh_connection().await {
            return Err(PublishError::new(ExportError::ShuttingDown, batch));
        }

        let sends = !batch.is_empty();
        let result = self.publish_batch(batch).await;
        if network && sends && result.is_ok() && self.state == ConnectionState::Disconnected {
            self.adopt_connection();
        }
        result
    }

    /// The client opened its own connection while publishing after a failed
    /// connect. Track it as established so the next batch does not back off
    /// and replace it.
    fn adopt_connection(&mut self) {
        debug!(
            "Worker {}: publish to {} succeeded, treating connection as established",
            self.id,
            self.client.host()
        );
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.backoff.reset();
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.reset();
        }
    }

    /// Replace an expired connection and connect if needed. Returns false
    /// when shutdown interrupted a backoff wait.
    async fn refresh_connection(&mut self) -> bool {
        let expired = self.ticker.as_ref().is_some_and(TtlTicker::fired);
        if self.state == ConnectionState::Connected && expired {
            info!(
                "Connection to {} reached its TTL, reconnecting",
                self.client.host()
            );
            if let Err(e) = self.client.close().await {
                warn!("Closing {} before reconnect failed: {}", self.client.host(), e);
            }
            self.state = ConnectionState::Disconnected;
            if let Some(window) = self.window.as_mut() {
                window.reset();
            }
        }

        if self.state == ConnectionState::Connected {
            return true;
        }

        if self.reconnect_attempts > 0 {
            let delay = self.backoff.next_delay();
            debug!(
                "Waiting {:?} before reconnecting to {}",
                delay,
                self.client.host()
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = sleep(delay) => {}
            }
        }

        if self.reconnect_attempts == 0 {
            info!("Connecting to {}", self.client.host());
        } else {
            info!(
                "Attempting to reconnect to {} with {} reconnect attempt(s)",
                self.client.host(),
                self.reconnect_attempts
            );
        }

        match self.client.connect().await {
            Ok(()) => {
                info!("Connection to {} established", self.client.host());
                self.state = ConnectionState::Connected;
                self.reconnect_attempts = 0;
                self.backoff.reset();
                if let Some(ticker) = self.ticker.as_mut() {
                    ticker.reset();
                }
                if let Some(window) = self.window.as_mut() {
                    window.reset();
                }
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.client.host(), e);
                self.reconnect_attempts += 1;
            }
        }

        true
    }

    /// Send the batch in window-sized rounds until everything is
    /// acknowledged or a round fails.
    async fn publish_batch(&mut self, batch: LogBatch) -> PublishResult {
        let total = batch.len();
        self.observer.new_batch(total);
        if total == 0 {
            return Ok(());
        }

        let batch_id = batch.batch_id().to_string();
        let mut records = batch.into_records();
        let mut offset = 0;

        while offset < total {
            let cap = self
                .window
                .as_ref()
                .map_or(self.bulk_max_size, Window::get);
            let len = cap.min(total - offset);
            let slice = &records[offset..offset + len];

            let outcome = match translate_all(slice) {
                Ok(events) => {
                    let started = Instant::now();
                    let outcome = self.client.publish(&events).await;
                    self.observer.report_latency(started.elapsed());
                    outcome
                }
                Err(e) => Err(SendFailure::new(0, e)),
            };

            let (sent, failure) = match outcome {
                Ok(0) => (
                    0,
                    Some(ExportError::Transport(
                        "remote acknowledged none of the events".to_string(),
                    )),
                ),
                Ok(acked) => (acked.min(len), None),
                Err(failure) => (failure.acked.min(len), Some(failure.error)),
            };

            if sent > 0 {
                offset += sent;
                self.observer.acked_events(sent);
            }

            match failure {
                None if sent == len => {
                    if let Some(window) = self.window.as_mut() {
                        window.try_grow(len);
                    }
                }
                None => {
                    debug!(
                        "Worker {}: {} of {} events acknowledged, continuing batch {}",
                        self.id, sent, len, batch_id
                    );
                }
                Some(cause) => {
                    let unsent = records.split_off(offset);
                    return Err(self.fail(batch_id, unsent, cause).await);
                }
            }
        }

        Ok(())
    }

    async fn fail(
        &mut self,
        batch_id: String,
        unsent: Vec<LogRecord>,
        cause: ExportError,
    ) -> PublishError {
        if let Some(window) = self.window.as_mut() {
            window.shrink();
        }
        if let Err(e) = self.client.close().await {
            debug!("Closing {} after failure returned: {}", self.client.host(), e);
        }
        self.state = ConnectionState::Disconnected;

        let err = PublishError::new(cause, LogBatch::with_id(batch_id, unsent));
        let unsent = err.remainder().len();
        if err.is_permanent() {
            self.observer.permanent_errors(unsent);
        } else {
            self.observer.retryable_errors(unsent);
        }

        error!("Failed to publish events to {}: {}", self.client.host(), err);
        err
    }
}
