//! File-tailing log collector that feeds the exporter

use crate::buffer::RecordBuffer;
use crate::config::Config;
use crate::errors::{ExportError, Result};
use crate::exporter::Exporter;
use crate::log_parser::{LineParser, ParserFactory};
use crate::observer::ExportMetrics;

use std::fs::Metadata;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::RwLock;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TAIL_FAILURE_LIMIT: u32 = 10;
const TAIL_FAILURE_PAUSE: Duration = Duration::from_secs(30);

/// Tails log files, buffers their lines and ships them through an [`Exporter`]
#[derive(Clone)]
pub struct LogCollector {
    config: Arc<Config>,
    parser: Arc<dyn LineParser>,
    buffer: RecordBuffer,
    exporter: Arc<Exporter>,
    metrics: Arc<ExportMetrics>,
    collector_id: String,
    cursors: Arc<RwLock<Vec<TailCursor>>>,
}

/// Where tailing left off in one file
#[derive(Debug, Default)]
struct TailCursor {
    offset: u64,
    modified: Option<SystemTime>,
    file_id: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
enum ReadPlan {
    Unchanged,
    Resume(u64),
    Restart,
}

impl TailCursor {
    fn plan(&mut self, metadata: &Metadata) -> ReadPlan {
        let id = file_id(metadata);
        let replaced = self.file_id.is_some() && self.file_id != id;
        self.file_id = id;

        if replaced || metadata.len() < self.offset {
            self.offset = 0;
            self.modified = None;
            ReadPlan::Restart
        } else if metadata.len() > self.offset || metadata.modified().ok() != self.modified {
            ReadPlan::Resume(self.offset)
        } else {
            ReadPlan::Unchanged
        }
    }

    fn commit(&mut self, offset: u64, modified: Option<SystemTime>) {
        self.offset = offset;
        self.modified = modified;
    }
}

impl LogCollector {
    /// Validate the configuration and start a lumberjack exporter for it
    pub fn new(config: Config) -> Result<Self> {
        config.validate_collector()?;

        let metrics = Arc::new(ExportMetrics::new());
        let exporter = Exporter::start(config.clone(), metrics.clone())?;

        Ok(Self::with_exporter(config, Arc::new(exporter), metrics))
    }

    /// Build a collector around an already running exporter
    pub fn with_exporter(config: Config, exporter: Arc<Exporter>, metrics: Arc<ExportMetrics>) -> Self {
        let parser: Arc<dyn LineParser> =
            Arc::from(ParserFactory::create(&config.line_format, &config.service_name));
        let buffer = RecordBuffer::new(config.max_buffer_size, config.bulk_max_size);

        let cursors = (0..config.log_paths.len())
            .map(|_| TailCursor::default())
            .collect();

        Self {
            config: Arc::new(config),
            parser,
            buffer,
            exporter,
            metrics,
            collector_id: Uuid::new_v4().to_string(),
            cursors: Arc::new(RwLock::new(cursors)),
        }
    }

    /// Run until Ctrl-C, then flush and shut the exporter down
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting log collector {} shipping to {:?}",
            self.collector_id, self.config.hosts
        );

        for index in 0..self.config.log_paths.len() {
            let collector = self.clone();
            tokio::spawn(async move {
                collector.tail_file(index).await;
            });
        }

        let flush_collector = self.clone();
        tokio::spawn(async move {
            flush_collector.periodic_flush().await;
        });

        let metrics_collector = self.clone();
        tokio::spawn(async move {
            metrics_collector.report_metrics().await;
        });

        tokio::signal::ctrl_c().await.map_err(|e| {
            ExportError::Other(format!("Failed to wait for shutdown signal: {}", e))
        })?;

        info!("Shutting down log collector");
        self.shutdown().await
    }

    /// Poll one file for appended lines for as long as the collector runs
    #[instrument(skip(self))]
    async fn tail_file(&self, index: usize) {
        let path = &self.config.log_paths[index];
        info!("Tailing {}", path);

        let mut poll = interval(TAIL_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failed_polls = 0;

        loop {
            poll.tick().await;

            match self.poll_file(index).await {
                Ok(lines) => {
                    failed_polls = 0;
                    if lines > 0 {
                        debug!("{} new lines in {}", lines, path);
                    }
                }
                Err(e) => {
                    failed_polls += 1;
                    warn!("Polling {} failed ({} in a row): {}", path, failed_polls, e);
                }
            }

            if failed_polls >= TAIL_FAILURE_LIMIT {
                error!("Pausing {} for {:?} after repeated failures", path, TAIL_FAILURE_PAUSE);
                sleep(TAIL_FAILURE_PAUSE).await;
                failed_polls = 0;
            }
        }
    }

    /// Read whatever was appended to file `index` since the last poll.
    /// A missing file is not an error; it may not have been created yet.
    async fn poll_file(&self, index: usize) -> Result<usize> {
        let path = self.config.log_paths[index].as_str();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let start = match self.cursors.write().await[index].plan(&metadata) {
            ReadPlan::Unchanged => return Ok(0),
            ReadPlan::Restart => {
                info!("{} was truncated or replaced, reading from the start", path);
                0
            }
            ReadPlan::Resume(offset) => offset,
        };

        let (lines, end) = self.read_lines_from(path, start).await?;
        self.cursors.write().await[index].commit(end, metadata.modified().ok());
        Ok(lines)
    }

    /// Feed complete lines after `start` to the parser. Returns the number
    /// of lines consumed and the offset just past the last one.
    async fn read_lines_from(&self, path: &str, start: u64) -> Result<(usize, u64)> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut offset = start;
        let mut consumed = 0;

        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            // stop short of a line that is still being written
            if read == 0 || !line.ends_with('\n') {
                break;
            }

            offset += read as u64;
            consumed += 1;

            let text = line.trim_end_matches(['\r', '\n']);
            if !text.trim().is_empty() {
                self.process_log_line(text).await;
            }
        }

        Ok((consumed, offset))
    }

    /// Parse one line into the buffer; unparsable lines are skipped
    async fn process_log_line(&self, line: &str) {
        match self.parser.parse(line) {
            Ok(Some(record)) => self.buffer.add(record).await,
            Ok(None) => {}
            Err(e) => warn!("Skipping log line: {}", e),
        }
    }

    /// Periodic flush of buffered data
    async fn periodic_flush(&self) {
        let mut flush_interval = interval(self.config.flush_interval);

        loop {
            flush_interval.tick().await;
            self.flush_buffers().await;
        }
    }

    /// Ship buffered records. Permanently failed records are dropped, a
    /// retryable remainder goes back to the front of the buffer together
    /// with every batch not yet attempted. Returns the number of records
    /// the remote acknowledged.
    async fn flush_buffers(&self) -> usize {
        if !self.buffer.has_data().await || !self.exporter.is_running() {
            return 0;
        }

        let batches = self.buffer.flush_all().await;
        debug!("Flushing {} batches", batches.len());

        let mut delivered = 0;
        let mut pending = batches.into_iter();
        while let Some(batch) = pending.next() {
            let size = batch.len();
            match self.exporter.push_with_retry(batch).await {
                Ok(()) => delivered += size,
                Err(err) if err.is_permanent() => {
                    delivered += size - err.remainder().len();
                    error!("Dropping undeliverable records: {}", err);
                }
                Err(err) => {
                    delivered += size - err.remainder().len();
                    warn!("Export stalled, keeping records for the next flush: {}", err);

                    let untried: Vec<_> = pending.by_ref().collect();
                    for later in untried.into_iter().rev() {
                        self.buffer.requeue(later).await;
                    }
                    self.buffer.requeue(err.into_remainder()).await;
                    break;
                }
            }
        }

        delivered
    }

    /// Report metrics periodically
    async fn report_metrics(&self) {
        let mut metrics_interval = interval(Duration::from_secs(60));

        loop {
            metrics_interval.tick().await;

            let stats = self.stats().await;
            info!(
                "Collector metrics - Buffered: {} records ({:.1}% utilization), Export: {} events in {} batches, {:.1}% acked, {} retryable, {} permanent",
                stats.buffered_records,
                stats.buffer_utilization,
                stats.exported_events,
                stats.exported_batches,
                stats.ack_rate,
                stats.retryable_errors,
                stats.permanent_errors
            );
        }
    }

    /// Flush what is buffered and stop the exporter
    pub async fn shutdown(&self) -> Result<()> {
        info!("Performing graceful shutdown");

        self.flush_buffers().await;
        let result = self.exporter.shutdown().await;

        let snapshot = self.metrics.snapshot();
        info!(
            "Final export metrics - Acked: {}/{} events ({:.1}%), Rounds: {}, Avg latency: {}ms",
            snapshot.acked_events,
            snapshot.events,
            snapshot.ack_rate,
            snapshot.rounds,
            snapshot.avg_latency_ms
        );

        let unsent = self.buffer.len().await;
        if unsent > 0 {
            warn!("{} buffered records were not delivered before shutdown", unsent);
        }

        info!("Log collector shutdown complete");
        result
    }

    /// Get collector statistics
    pub async fn stats(&self) -> CollectorStats {
        let snapshot = self.metrics.snapshot();

        CollectorStats {
            collector_id: self.collector_id.clone(),
            service_name: self.config.service_name.clone(),
            hosts: self.config.hosts.clone(),
            buffered_records: self.buffer.len().await,
            buffer_utilization: self.buffer.utilization().await,
            exported_batches: snapshot.batches,
            exported_events: snapshot.events,
            acked_events: snapshot.acked_events,
            retryable_errors: snapshot.retryable_errors,
            permanent_errors: snapshot.permanent_errors,
            ack_rate: snapshot.ack_rate,
            avg_latency_ms: snapshot.avg_latency_ms,
        }
    }
}

#[cfg(unix)]
fn file_id(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &Metadata) -> Option<u64> {
    None
}

/// Collector statistics
#[derive(Debug, Clone)]
pub struct CollectorStats {
    pub collector_id: String,
    pub service_name: String,
    pub hosts: Vec<String>,
    pub buffered_records: usize,
    pub buffer_utilization: f64,
    pub exported_batches: u64,
    pub exported_events: u64,
    pub acked_events: u64,
    pub retryable_errors: u64,
    pub permanent_errors: u64,
    pub ack_rate: f64,
    pub avg_latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BoxedClient;
    use crate::testing::{ClientScript, MockClient, PlannedSend};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn collector_for(file: &NamedTempFile, line_format: &str, max_retries: i64) -> (LogCollector, ClientScript) {
        let config = Config {
            hosts: vec!["logstash".to_string()],
            workers: 1,
            max_retries,
            log_paths: vec![file.path().to_string_lossy().to_string()],
            line_format: line_format.to_string(),
            ..Config::default()
        };

        let script = ClientScript::new();
        let metrics = Arc::new(ExportMetrics::new());
        let client_script = script.clone();
        let exporter = Exporter::start_with(config.clone(), metrics.clone(), move |host| {
            Ok(Box::new(MockClient::new(host, client_script.clone())) as BoxedClient)
        })
        .unwrap();

        (
            LogCollector::with_exporter(config, Arc::new(exporter), metrics),
            script,
        )
    }

    fn messages(script: &ClientScript) -> Vec<String> {
        script
            .sent()
            .iter()
            .map(|e| e.fields["message"].as_str().unwrap().to_string())
            .collect()
    }

    fn append(file: &NamedTempFile, lines: &[&str]) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    #[tokio::test]
    async fn test_collector_ships_file_lines() {
        let file = NamedTempFile::new().unwrap();
        append(
            &file,
            &[
                r#"{"@metadata": {"beat": "filebeat"}, "message": "json line"}"#,
                "plain line",
                "",
            ],
        );
        let (collector, script) = collector_for(&file, "auto", 3);

        assert_eq!(collector.poll_file(0).await.unwrap(), 3);
        assert_eq!(collector.buffer.len().await, 2);
        assert_eq!(collector.flush_buffers().await, 2);
        assert_eq!(messages(&script), vec!["json line", "plain line"]);

        append(&file, &["third line"]);
        assert_eq!(collector.poll_file(0).await.unwrap(), 1);
        assert_eq!(collector.poll_file(0).await.unwrap(), 0);

        collector.shutdown().await.unwrap();
        assert_eq!(messages(&script).len(), 3);

        let stats = collector.stats().await;
        assert_eq!(stats.acked_events, 3);
        assert_eq!(stats.buffered_records, 0);
    }

    #[tokio::test]
    async fn test_truncated_file_is_read_from_start() {
        let file = NamedTempFile::new().unwrap();
        append(&file, &["first long line of text", "second long line of text"]);
        let (collector, script) = collector_for(&file, "plain", 3);

        assert_eq!(collector.poll_file(0).await.unwrap(), 2);
        std::fs::write(file.path(), "fresh\n").unwrap();
        assert_eq!(collector.poll_file(0).await.unwrap(), 1);

        collector.flush_buffers().await;
        assert_eq!(messages(&script).last().map(String::as_str), Some("fresh"));
        collector.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaced_file_is_read_from_start() {
        let file = NamedTempFile::new().unwrap();
        append(&file, &["before rotation"]);
        let (collector, script) = collector_for(&file, "plain", 3);
        assert_eq!(collector.poll_file(0).await.unwrap(), 1);

        let dir = file.path().parent().unwrap();
        let mut replacement = NamedTempFile::new_in(dir).unwrap();
        writeln!(replacement, "after rotation, a longer first line").unwrap();
        replacement.persist(file.path()).unwrap();

        assert_eq!(collector.poll_file(0).await.unwrap(), 1);
        collector.flush_buffers().await;
        assert_eq!(
            messages(&script),
            vec!["before rotation", "after rotation, a longer first line"]
        );
        collector.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let file = NamedTempFile::new().unwrap();
        let (collector, _script) = collector_for(&file, "plain", 3);

        std::fs::write(file.path(), "complete\npartial").unwrap();
        assert_eq!(collector.poll_file(0).await.unwrap(), 1);

        append(&file, &[" line"]);
        assert_eq!(collector.poll_file(0).await.unwrap(), 1);

        let batch = collector.buffer.drain_batch().await.unwrap();
        let lines: Vec<_> = batch
            .records()
            .iter()
            .map(|r| r.body["message"].as_str().unwrap())
            .collect();
        assert_eq!(lines, vec!["complete", "partial line"]);
        collector.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            hosts: vec!["logstash".to_string()],
            workers: 1,
            log_paths: vec![dir.path().join("not-yet.log").to_string_lossy().to_string()],
            ..Config::default()
        };
        let metrics = Arc::new(ExportMetrics::new());
        let script = ClientScript::new();
        let exporter = Exporter::start_with(config.clone(), metrics.clone(), move |host| {
            Ok(Box::new(MockClient::new(host, script.clone())) as BoxedClient)
        })
        .unwrap();
        let collector = LogCollector::with_exporter(config, Arc::new(exporter), metrics);

        assert_eq!(collector.poll_file(0).await.unwrap(), 0);
        collector.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_records_kept_once_exporter_stopped() {
        let file = NamedTempFile::new().unwrap();
        append(&file, &["kept"]);
        let (collector, script) = collector_for(&file, "plain", 3);

        collector.poll_file(0).await.unwrap();
        collector.exporter.shutdown().await.unwrap();

        assert_eq!(collector.flush_buffers().await, 0);
        assert_eq!(collector.buffer.len().await, 1);
        assert!(script.sent().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_remainder() {
        let file = NamedTempFile::new().unwrap();
        append(&file, &["a", "b", "c"]);
        let (collector, script) = collector_for(&file, "plain", 0);
        script.plan(PlannedSend::Fail {
            acked: 1,
            permanent: false,
        });

        collector.poll_file(0).await.unwrap();
        assert_eq!(collector.flush_buffers().await, 1);
        assert_eq!(collector.buffer.len().await, 2);

        assert_eq!(collector.flush_buffers().await, 2);
        assert_eq!(messages(&script), vec!["a", "b", "c"]);
        collector.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_records() {
        let file = NamedTempFile::new().unwrap();
        append(&file, &[r#"{"message": "no metadata"}"#, "not json at all"]);
        let (collector, script) = collector_for(&file, "json", 3);

        collector.poll_file(0).await.unwrap();
        assert_eq!(collector.buffer.len().await, 1);
        assert_eq!(collector.flush_buffers().await, 0);
        assert!(collector.buffer.is_empty().await);
        assert!(script.sent().is_empty());

        collector.shutdown().await.unwrap();
        assert_eq!(collector.stats().await.permanent_errors, 1);
    }
}
