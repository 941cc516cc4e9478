//! Lumberjack v2 TCP client

use crate::client::{ConnectionClient, SendFailure};
use crate::config::Config;
use crate::encoder::EventEncoder;
use crate::errors::{ExportError, Result};
use crate::event::Event;
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 5044;

const PROTOCOL_VERSION: u8 = b'2';
const FRAME_WINDOW: u8 = b'W';
const FRAME_JSON: u8 = b'J';
const FRAME_COMPRESSED: u8 = b'C';
const FRAME_ACK: u8 = b'A';
const ACK_FRAME_LEN: usize = 6;

/// Client for one Logstash beats input.
pub struct LumberjackClient {
    host: String,
    address: String,
    timeout: Duration,
    compression_level: u32,
    encoder: EventEncoder,
    stream: Option<TcpStream>,
}

impl LumberjackClient {
    pub fn new(host: &str, config: &Config) -> Self {
        Self {
            host: host.to_string(),
            address: resolve_address(host),
            timeout: config.timeout,
            compression_level: config.compression_level,
            encoder: EventEncoder::new(config.index.clone(), config.escape_html),
            stream: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Window frame followed by the data frames, compressed when configured.
    fn build_payload(&self, events: &[Event]) -> Result<Vec<u8>> {
        let count = frame_u32(events.len())?;

        let mut frames = Vec::new();
        for (seq, event) in (1u32..).zip(events) {
            let doc = self.encoder.encode(event)?;
            frames.extend_from_slice(&[PROTOCOL_VERSION, FRAME_JSON]);
            frames.extend_from_slice(&seq.to_be_bytes());
            frames.extend_from_slice(&frame_u32(doc.len())?.to_be_bytes());
            frames.extend_from_slice(&doc);
        }

        let mut payload = Vec::with_capacity(frames.len() + 12);
        payload.extend_from_slice(&[PROTOCOL_VERSION, FRAME_WINDOW]);
        payload.extend_from_slice(&count.to_be_bytes());

        if self.compression_level == 0 {
            payload.extend_from_slice(&frames);
            return Ok(payload);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.compression_level));
        let compressed = encoder
            .write_all(&frames)
            .and_then(|_| encoder.finish())
            .map_err(|e| ExportError::InvalidRecord(format!("compressing window: {}", e)))?;

        payload.extend_from_slice(&[PROTOCOL_VERSION, FRAME_COMPRESSED]);
        payload.extend_from_slice(&frame_u32(compressed.len())?.to_be_bytes());
        payload.extend_from_slice(&compressed);
        Ok(payload)
    }
}

#[async_trait]
impl ConnectionClient for LumberjackClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&mut self) -> Result<()> {
        self.stream = None;

        let stream = match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ExportError::Transport(format!(
                    "connection to {} failed: {}",
                    self.address, e
                )));
            }
            Err(_) => return Err(ExportError::Timeout),
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", self.address, e);
        }

        debug!("Connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn publish(&mut self, events: &[Event]) -> std::result::Result<usize, SendFailure> {
        if events.is_empty() {
            return Ok(0);
        }

        let payload = self
            .build_payload(events)
            .map_err(|e| SendFailure::new(0, e))?;
        let count = events.len() as u32;

        if self.stream.is_none() {
            self.connect().await.map_err(|e| SendFailure::new(0, e))?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(SendFailure::new(0, ExportError::NotConnected));
        };

        match send_window(stream, &payload, count, self.timeout).await {
            Ok(acked) => Ok(acked as usize),
            Err((acked, error)) => {
                debug!(
                    "Dropping connection to {} after {} of {} acks: {}",
                    self.address, acked, count, error
                );
                self.stream = None;
                Err(SendFailure::new(acked as usize, error))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Write one window and wait until every event in it is acknowledged.
/// On failure the highest sequence number acknowledged so far is returned
/// with the error.
async fn send_window(
    stream: &mut TcpStream,
    payload: &[u8],
    count: u32,
    io_timeout: Duration,
) -> std::result::Result<u32, (u32, ExportError)> {
    match timeout(io_timeout, stream.write_all(payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err((0, ExportError::Io(e))),
        Err(_) => return Err((0, ExportError::Timeout)),
    }

    let mut acked = 0u32;
    while acked < count {
        let mut frame = [0u8; ACK_FRAME_LEN];
        match timeout(io_timeout, stream.read_exact(&mut frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err((acked, ExportError::Io(e))),
            Err(_) => return Err((acked, ExportError::Timeout)),
        }

        if frame[0] != PROTOCOL_VERSION || frame[1] != FRAME_ACK {
            return Err((
                acked,
                ExportError::Transport(format!(
                    "unexpected frame {:?} while waiting for ack",
                    &frame[..2]
                )),
            ));
        }

        let seq = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
        if seq > count {
            return Err((
                acked,
                ExportError::Transport(format!("ack {} beyond window of {}", seq, count)),
            ));
        }
        acked = acked.max(seq);
    }

    Ok(acked)
}

fn frame_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ExportError::InvalidRecord(format!("frame of {} bytes", len)))
}

/// `host` with the default beats port appended when none is given.
pub fn resolve_address(host: &str) -> String {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return if rest.contains("]:") {
            host.to_string()
        } else {
            format!("{}:{}", host, DEFAULT_PORT)
        };
    }
    match host.matches(':').count() {
        0 => format!("{}:{}", host, DEFAULT_PORT),
        1 => host.to_string(),
        _ => format!("[{}]:{}", host, DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_events;
    use flate2::read::ZlibDecoder;
    use serde_json::Value;
    use std::io::Read;
    use tokio::net::TcpListener;

    fn config(compression_level: u32) -> Config {
        Config {
            hosts: vec!["127.0.0.1".to_string()],
            compression_level,
            timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    /// Read one window from the wire and return `(seq, document)` pairs.
    async fn read_window(stream: &mut TcpStream) -> Vec<(u32, Value)> {
        let mut head = [0u8; 6];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..2], b"2W");
        let count = u32::from_be_bytes([head[2], head[3], head[4], head[5]]);

        let mut kind = [0u8; 2];
        stream.read_exact(&mut kind).await.unwrap();

        let mut raw = Vec::new();
        if &kind == b"2C" {
            let len = stream.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            ZlibDecoder::new(&body[..]).read_to_end(&mut raw).unwrap();
        } else {
            for i in 0..count {
                if i > 0 {
                    stream.read_exact(&mut kind).await.unwrap();
                }
                raw.extend_from_slice(&kind);
                let seq = stream.read_u32().await.unwrap();
                let len = stream.read_u32().await.unwrap();
                let mut body = vec![0u8; len as usize];
                stream.read_exact(&mut body).await.unwrap();
                raw.extend_from_slice(&seq.to_be_bytes());
                raw.extend_from_slice(&len.to_be_bytes());
                raw.extend_from_slice(&body);
            }
        }

        let mut frames = Vec::new();
        let mut rest = &raw[..];
        while !rest.is_empty() {
            assert_eq!(&rest[..2], b"2J");
            let seq = u32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]);
            let len = u32::from_be_bytes([rest[6], rest[7], rest[8], rest[9]]) as usize;
            frames.push((seq, serde_json::from_slice(&rest[10..10 + len]).unwrap()));
            rest = &rest[10 + len..];
        }
        assert_eq!(frames.len(), count as usize);
        frames
    }

    async fn ack(stream: &mut TcpStream, seq: u32) {
        let mut frame = vec![b'2', b'A'];
        frame.extend_from_slice(&seq.to_be_bytes());
        stream.write_all(&frame).await.unwrap();
    }

    async fn round_trip(compression_level: u32) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frames = read_window(&mut stream).await;
            ack(&mut stream, frames.len() as u32).await;
            frames
        });

        let mut client = LumberjackClient::new(&addr, &config(compression_level));
        let events = sample_events(3);
        let acked = client.publish(&events).await.unwrap();
        assert_eq!(acked, 3);
        assert!(client.is_connected());

        let frames = server.await.unwrap();
        let seqs: Vec<u32> = frames.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(frames[2].1["message"], "line 2");
        assert_eq!(frames[0].1["@metadata"]["beat"], "filebeat");
        assert!(frames[0].1["@timestamp"].is_string());

        client.close().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_uncompressed_window() {
        round_trip(0).await;
    }

    #[tokio::test]
    async fn test_compressed_window() {
        round_trip(6).await;
    }

    #[tokio::test]
    async fn test_partial_ack_then_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_window(&mut stream).await;
            ack(&mut stream, 1).await;
        });

        let mut client = LumberjackClient::new(&addr, &config(3));
        let failure = client.publish(&sample_events(4)).await.unwrap_err();
        server.await.unwrap();

        assert_eq!(failure.acked, 1);
        assert!(!failure.error.is_permanent());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut client = LumberjackClient::new(&addr, &config(0));
        assert!(client.connect().await.is_err());

        let failure = client.publish(&sample_events(1)).await.unwrap_err();
        assert_eq!(failure.acked, 0);
        assert!(!failure.error.is_permanent());
    }

    #[tokio::test]
    async fn test_empty_publish_sends_nothing() {
        let mut client = LumberjackClient::new("127.0.0.1:1", &config(0));
        assert_eq!(client.publish(&[]).await.unwrap(), 0);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_resolve_address() {
        assert_eq!(resolve_address("logstash"), "logstash:5044");
        assert_eq!(resolve_address("logstash:5045"), "logstash:5045");
        assert_eq!(resolve_address("[::1]:5000"), "[::1]:5000");
        assert_eq!(resolve_address("[::1]"), "[::1]:5044");
        assert_eq!(resolve_address("fe80::1"), "[fe80::1]:5044");
    }
}
