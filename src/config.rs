//! Configuration for the exporter and the collector binary

use crate::errors::{ExportError, Result};
use crate::window::DEFAULT_START_WINDOW_SIZE;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub init: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Downstream hosts, `host` or `host:port`
    pub hosts: Vec<String>,

    /// Overrides `@metadata.beat` on every event
    pub index: Option<String>,

    /// Connections per host
    pub workers: usize,

    /// One worker per host and slot when true, failover across hosts when false
    pub load_balance: bool,

    /// Upper bound on events per round
    pub bulk_max_size: usize,

    pub slow_start: bool,

    pub slow_start_window: i32,

    /// Connect, write and ACK timeout
    pub timeout: Duration,

    /// Proactive reconnect interval, zero disables it
    pub ttl: Duration,

    /// zlib level for data frames, 0 sends them uncompressed
    pub compression_level: u32,

    /// Caller-side resubmissions of a retryable remainder, -1 for unlimited
    pub max_retries: i64,

    pub backoff: Backoff,

    pub escape_html: bool,

    /// Beat marker stamped on plain text lines
    pub service_name: String,

    /// Files tailed by the collector
    pub log_paths: Vec<String>,

    /// `json`, `plain` or `auto`
    pub line_format: String,

    /// Flush interval for buffered records
    pub flush_interval: Duration,

    /// Maximum records held in memory
    pub max_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            index: None,
            workers: 2,
            load_balance: true,
            bulk_max_size: 2048,
            slow_start: false,
            slow_start_window: DEFAULT_START_WINDOW_SIZE,
            timeout: Duration::from_secs(30),
            ttl: Duration::ZERO,
            compression_level: 3,
            max_retries: 3,
            backoff: Backoff::default(),
            escape_html: false,
            service_name: "filebeat".to_string(),
            log_paths: vec!["/var/log/app/application.log".to_string()],
            line_format: "auto".to_string(),
            flush_interval: Duration::from_secs(5),
            max_buffer_size: 10000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup. Unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(hosts) = lookup("LOGSTASH_HOSTS") {
            config.hosts = split_list(&hosts);
        }

        if let Some(index) = lookup("LOGSTASH_INDEX") {
            let index = index.trim();
            if !index.is_empty() {
                config.index = Some(index.to_string());
            }
        }

        if let Some(workers) = lookup("WORKERS").and_then(|v| v.parse().ok()) {
            config.workers = workers;
        }

        if let Some(load_balance) = lookup("LOADBALANCE") {
            config.load_balance = parse_flag(&load_balance);
        }

        if let Some(size) = lookup("BULK_MAX_SIZE").and_then(|v| v.parse().ok()) {
            config.bulk_max_size = size;
        }

        if let Some(slow_start) = lookup("SLOW_START") {
            config.slow_start = parse_flag(&slow_start);
        }

        if let Some(window) = lookup("SLOW_START_WINDOW").and_then(|v| v.parse().ok()) {
            config.slow_start_window = window;
        }

        if let Some(seconds) = lookup("TIMEOUT_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            config.timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = lookup("TTL_SECONDS").and_then(|v| v.parse::<u64>().ok()) {
            config.ttl = Duration::from_secs(seconds);
        }

        if let Some(level) = lookup("COMPRESSION_LEVEL").and_then(|v| v.parse().ok()) {
            config.compression_level = level;
        }

        if let Some(retries) = lookup("MAX_RETRIES").and_then(|v| v.parse().ok()) {
            config.max_retries = retries;
        }

        if let Some(ms) = lookup("BACKOFF_INIT_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.backoff.init = Duration::from_millis(ms);
        }

        if let Some(ms) = lookup("BACKOFF_MAX_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.backoff.max = Duration::from_millis(ms);
        }

        if let Some(escape) = lookup("ESCAPE_HTML") {
            config.escape_html = parse_flag(&escape);
        }

        if let Some(service_name) = lookup("SERVICE_NAME") {
            config.service_name = service_name;
        }

        if let Some(log_paths) = lookup("LOG_PATHS") {
            config.log_paths = split_list(&log_paths);
        }

        if let Some(format) = lookup("LINE_FORMAT") {
            config.line_format = format.trim().to_lowercase();
        }

        if let Some(seconds) = lookup("FLUSH_INTERVAL_SECONDS").and_then(|v| v.parse::<u64>().ok())
        {
            config.flush_interval = Duration::from_secs(seconds);
        }

        if let Some(size) = lookup("MAX_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
            config.max_buffer_size = size;
        }

        config
    }

    /// Validate the settings the export pipeline depends on
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(invalid("at least one host must be specified"));
        }

        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(invalid("host entries cannot be empty"));
        }

        if self.workers == 0 {
            return Err(invalid("workers must be greater than 0"));
        }

        if self.bulk_max_size == 0 {
            return Err(invalid("bulk_max_size must be greater than 0"));
        }

        if self.slow_start && self.slow_start_window <= 0 {
            return Err(invalid("slow_start_window must be greater than 0"));
        }

        if self.compression_level > 9 {
            return Err(invalid("compression_level must be between 0 and 9"));
        }

        if self.max_retries < -1 {
            return Err(invalid("max_retries must be -1 or greater"));
        }

        if self.backoff.init > self.backoff.max {
            return Err(invalid("backoff init cannot exceed backoff max"));
        }

        Ok(())
    }

    /// Validate everything the collector binary needs
    pub fn validate_collector(&self) -> Result<()> {
        self.validate()?;

        if self.service_name.is_empty() {
            return Err(invalid("service_name cannot be empty"));
        }

        if self.log_paths.is_empty() {
            return Err(invalid("at least one log path must be specified"));
        }

        if !matches!(self.line_format.as_str(), "json" | "plain" | "auto") {
            return Err(invalid("line_format must be json, plain or auto"));
        }

        if self.max_buffer_size == 0 {
            return Err(invalid("max_buffer_size must be greater than 0"));
        }

        if self.flush_interval.is_zero() {
            return Err(invalid("flush_interval must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ExportError {
    ExportError::Config(msg.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}
