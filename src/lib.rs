//! Lumberjack log exporter
//!
//! Streams batches of structured log records to Logstash beats inputs over
//! persistent connections, with slow-start flow control, TTL-based
//! reconnects and permanent/retryable failure classification. A
//! file-tailing collector feeds the exporter in the bundled binary.

pub mod buffer;
pub mod client;
pub mod collector;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod event;
pub mod exporter;
pub mod log_parser;
pub mod lumberjack;
pub mod observer;
pub mod queue;
pub mod records;
pub mod window;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ConnectionClient, SendFailure};
pub use collector::LogCollector;
pub use config::Config;
pub use errors::{ExportError, FailureKind, JoinedError, PublishError, Result};
pub use event::Event;
pub use exporter::Exporter;
pub use observer::{ExportMetrics, NilObserver, Observer};
pub use records::{LogBatch, LogRecord};
