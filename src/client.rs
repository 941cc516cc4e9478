//! Connection client contract and host failover

use crate::errors::{ExportError, Result};
use crate::event::Event;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::fmt;
use tracing::{debug, warn};

/// A send that stopped part way. `acked` events at the front of the slice
/// were confirmed by the remote before `error` occurred.
#[derive(Debug)]
pub struct SendFailure {
    pub acked: usize,
    pub error: ExportError,
}

impl SendFailure {
    pub fn new(acked: usize, error: ExportError) -> Self {
        Self { acked, error }
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (acked {})", self.error, self.acked)
    }
}

impl std::error::Error for SendFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// One physical connection to a downstream host.
#[async_trait]
pub trait ConnectionClient: Send {
    fn host(&self) -> &str;

    /// Whether the worker should run the reconnect/TTL policy for this
    /// client. Decided once when the worker is built.
    fn supports_reconnect(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<()>;

    /// Send `events` in order and return how many the remote acknowledged.
    async fn publish(&mut self, events: &[Event]) -> std::result::Result<usize, SendFailure>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxedClient = Box<dyn ConnectionClient>;

/// Presents several hosts as one client, moving to the next host whenever
/// the active one fails.
pub struct FailoverClient {
    clients: Vec<BoxedClient>,
    active: usize,
}

impl FailoverClient {
    pub fn new(mut clients: Vec<BoxedClient>) -> Result<Self> {
        if clients.is_empty() {
            return Err(ExportError::Config(
                "failover client needs at least one host".to_string(),
            ));
        }
        clients.shuffle(&mut rand::rng());
        Ok(Self { clients, active: 0 })
    }

    fn rotate(&mut self) {
        self.active = (self.active + 1) % self.clients.len();
    }
}

#[async_trait]
impl ConnectionClient for FailoverClient {
    fn host(&self) -> &str {
        self.clients[self.active].host()
    }

    async fn connect(&mut self) -> Result<()> {
        let mut last_error = None;

        for _ in 0..self.clients.len() {
            match self.clients[self.active].connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Failover connect to {} failed: {}", self.host(), e);
                    last_error = Some(e);
                    self.rotate();
                }
            }
        }

        Err(last_error.unwrap_or(ExportError::NotConnected))
    }

    async fn publish(&mut self, events: &[Event]) -> std::result::Result<usize, SendFailure> {
        match self.clients[self.active].publish(events).await {
            Ok(acked) => Ok(acked),
            Err(failure) => {
                if let Err(e) = self.clients[self.active].close().await {
                    debug!("Closing failed host {} returned: {}", self.host(), e);
                }
                self.rotate();
                Err(failure)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.clients[self.active].close().await
    }
}
