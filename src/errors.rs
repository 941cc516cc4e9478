//! Error types for the exporter

use crate::records::LogBatch;
use std::fmt;

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug)]
pub enum ExportError {
    /// IO operation failed
    Io(std::io::Error),

    /// JSON serialization/deserialization failed
    Json(serde_json::Error),

    /// Configuration error
    Config(String),

    /// Log line could not be parsed into a record
    LogParse(String),

    /// Record is not shaped like an exportable event
    InvalidRecord(String),

    /// Connection or send failure
    Transport(String),

    /// Remote explicitly refused the payload
    Rejected(String),

    /// Connect, write or ACK wait exceeded the configured timeout
    Timeout,

    /// No open connection to the remote host
    NotConnected,

    /// The exporter no longer accepts batches
    ShuttingDown,

    /// A worker exited without reporting a result
    WorkerStopped,

    /// Generic error with message
    Other(String),
}

/// Whether resubmitting the unsent records can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Permanent,
    Retryable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::Retryable => write!(f, "retryable"),
        }
    }
}

impl ExportError {
    /// Classify the error. Malformed data never becomes valid by resending
    /// it; everything else is assumed transient.
    pub fn kind(&self) -> FailureKind {
        match self {
            ExportError::InvalidRecord(_)
            | ExportError::Rejected(_)
            | ExportError::Json(_)
            | ExportError::Config(_) => FailureKind::Permanent,
            _ => FailureKind::Retryable,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == FailureKind::Permanent
    }
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Io(err) => write!(f, "IO error: {}", err),
            ExportError::Json(err) => write!(f, "JSON error: {}", err),
            ExportError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ExportError::LogParse(msg) => write!(f, "Log parsing error: {}", msg),
            ExportError::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            ExportError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ExportError::Rejected(msg) => write!(f, "Rejected by remote: {}", msg),
            ExportError::Timeout => write!(f, "Operation timed out"),
            ExportError::NotConnected => write!(f, "No connection to remote host"),
            ExportError::ShuttingDown => write!(f, "Exporter is shutting down"),
            ExportError::WorkerStopped => write!(f, "Worker stopped before reporting a result"),
            ExportError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Io(err) => Some(err),
            ExportError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Json(err)
    }
}

/// Failed publish of a batch, with the records that were never acknowledged.
#[derive(Debug)]
pub struct PublishError {
    kind: FailureKind,
    cause: ExportError,
    remainder: LogBatch,
}

impl PublishError {
    pub fn new(cause: ExportError, remainder: LogBatch) -> Self {
        Self {
            kind: cause.kind(),
            cause,
            remainder,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == FailureKind::Permanent
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }

    pub fn cause(&self) -> &ExportError {
        &self.cause
    }

    /// Records that were not acknowledged, in their original order.
    pub fn remainder(&self) -> &LogBatch {
        &self.remainder
    }

    pub fn into_remainder(self) -> LogBatch {
        self.remainder
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure publishing batch {} ({} unsent events): {}",
            self.kind,
            self.remainder.batch_id(),
            self.remainder.len(),
            self.cause
        )
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Several publish failures reported as one.
#[derive(Debug)]
pub struct JoinedError {
    errors: Vec<PublishError>,
}

impl JoinedError {
    pub fn new(errors: Vec<PublishError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[PublishError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Total number of records left unsent across all failures.
    pub fn unsent_events(&self) -> usize {
        self.errors.iter().map(|e| e.remainder().len()).sum()
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {}
