//! Worker pool that fans batches out over the configured hosts

use crate::client::{BoxedClient, FailoverClient};
use crate::config::Config;
use crate::errors::{ExportError, JoinedError, PublishError, Result};
use crate::lumberjack::LumberjackClient;
use crate::observer::Observer;
use crate::queue::{QueueSender, UNBUFFERED, distribution_queue};
use crate::records::LogBatch;
use crate::worker::{PublishResult, WorkItem, Worker, WorkerOptions};
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Log exporter: owns the distribution queue and one worker per connection.
pub struct Exporter {
    sender: Mutex<Option<QueueSender<WorkItem>>>,
    workers: tokio::sync::Mutex<Vec<Worker>>,
    worker_count: usize,
    max_retries: i64,
}

impl Exporter {
    /// Start an exporter speaking lumberjack to every configured host.
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config, observer: Arc<dyn Observer>) -> Result<Self> {
        let client_config = config.clone();
        Self::start_with(config, observer, move |host| {
            Ok(Box::new(LumberjackClient::new(host, &client_config)) as BoxedClient)
        })
    }

    /// Start an exporter whose connections come from `make_client`, called
    /// once per host for every worker slot.
    pub fn start_with<F>(config: Config, observer: Arc<dyn Observer>, mut make_client: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<BoxedClient>,
    {
        config.validate()?;

        let mut clients = Vec::with_capacity(config.hosts.len() * config.workers);
        if config.load_balance {
            for host in &config.hosts {
                for _ in 0..config.workers {
                    clients.push(make_client(host.as_str())?);
                }
            }
        } else {
            for _ in 0..config.workers {
                let per_host = config
                    .hosts
                    .iter()
                    .map(|host| make_client(host.as_str()))
                    .collect::<Result<Vec<_>>>()?;
                clients.push(Box::new(FailoverClient::new(per_host)?) as BoxedClient);
            }
        }

        let (sender, receiver) = distribution_queue(UNBUFFERED);
        let workers: Vec<Worker> = clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| {
                let options = WorkerOptions::from_config(client.as_ref(), &config);
                Worker::spawn(id, client, options, receiver.clone(), observer.clone())
            })
            .collect();
        drop(receiver);

        info!(
            "Exporter started with {} workers across {} hosts (load balance: {}, slow start: {})",
            workers.len(),
            config.hosts.len(),
            config.load_balance,
            config.slow_start
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_count: workers.len(),
            workers: tokio::sync::Mutex::new(workers),
            max_retries: config.max_retries,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// True until shutdown starts and while some worker still receives.
    pub fn is_running(&self) -> bool {
        self.current_sender()
            .is_some_and(|sender| !sender.is_disconnected())
    }

    fn current_sender(&self) -> Option<QueueSender<WorkItem>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand `batch` to the next idle worker and wait for its outcome.
    pub async fn push(&self, batch: LogBatch) -> PublishResult {
        let Some(sender) = self.current_sender() else {
            return Err(PublishError::new(ExportError::ShuttingDown, batch));
        };

        let (item, reply) = WorkItem::new(batch);
        if let Err(item) = sender.send(item).await {
            return Err(PublishError::new(ExportError::ShuttingDown, item.batch));
        }
        drop(sender);

        match reply.await {
            Ok(result) => result,
            // Only a panicked worker drops the reply; the batch went with it
            Err(_) => Err(PublishError::new(
                ExportError::WorkerStopped,
                LogBatch::new(Vec::new()),
            )),
        }
    }

    /// Push, resubmitting the retryable remainder up to `max_retries` times.
    #[instrument(skip(self, batch), fields(batch_id = %batch.batch_id(), events = batch.len()))]
    pub async fn push_with_retry(&self, batch: LogBatch) -> PublishResult {
        let mut batch = batch;
        let mut attempt: i64 = 0;

        loop {
            let err = match self.push(batch).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let exhausted = self.max_retries >= 0 && attempt >= self.max_retries;
            let stopping = matches!(
                err.cause(),
                ExportError::ShuttingDown | ExportError::WorkerStopped
            );
            if err.is_permanent() || exhausted || stopping {
                return Err(err);
            }

            attempt += 1;
            warn!(
                "Resubmitting {} unsent events of batch {} (retry {})",
                err.remainder().len(),
                err.remainder().batch_id(),
                attempt
            );
            batch = err.into_remainder();
        }
    }

    /// Push every batch concurrently, joining all failures into one error.
    pub async fn push_all(&self, batches: Vec<LogBatch>) -> std::result::Result<(), JoinedError> {
        let results = join_all(batches.into_iter().map(|batch| self.push(batch))).await;
        let errors: Vec<PublishError> = results
            .into_iter()
            .filter_map(std::result::Result::err)
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(JoinedError::new(errors))
        }
    }

    /// Stop accepting batches, close every worker and wait for all of them.
    /// Returns the first close error after attempting every worker.
    pub async fn shutdown(&self) -> Result<()> {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let mut guard = self.workers.lock().await;
        let workers = std::mem::take(&mut *guard);
        if workers.is_empty() {
            return Ok(());
        }

        info!("Shutting down {} export workers", workers.len());
        for worker in &workers {
            worker.signal_close();
        }

        let mut first_error = None;
        for worker in workers {
            let id = worker.id();
            let host = worker.host().to_string();
            match worker.close().await {
                Ok(()) => debug!("Worker {} for {} closed", id, host),
                Err(e) => {
                    warn!("Worker {} for {} failed to close: {}", id, host, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Exporter shutdown complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
