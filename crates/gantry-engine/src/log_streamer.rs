//! Per-container log streaming
//!
//! Each container gets its own streamer carrying the container's log
//! tagging. Process output is buffered until a newline or the message cap,
//! framed, signed, and shipped to the UDP log sink by a background
//! forwarder.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

/// Largest single log message; longer output is split at this boundary
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Log tagging for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub app_guid: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Which process stream a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Out,
    Err,
}

/// One framed log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub app_guid: String,
    pub source_name: String,
    /// Instance index, zero when the container has none
    pub source_id: u32,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message: String,
    pub timestamp_ns: i64,
}

/// Per-container streamer. Hand its writers to the backend as process IO;
/// composite steps use the emit helpers for progress lines.
pub struct LogStreamer {
    config: LogConfig,
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl LogStreamer {
    pub fn new(config: LogConfig, tx: mpsc::UnboundedSender<LogMessage>) -> Self {
        Self { config, tx }
    }

    pub fn stdout(&self) -> LogWriter {
        LogWriter::new(self.config.clone(), MessageKind::Out, self.tx.clone())
    }

    pub fn stderr(&self) -> LogWriter {
        LogWriter::new(self.config.clone(), MessageKind::Err, self.tx.clone())
    }

    pub fn emit_stdout(&self, text: &str) {
        send_message(&self.tx, &self.config, MessageKind::Out, text.as_bytes());
    }

    pub fn emit_stderr(&self, text: &str) {
        send_message(&self.tx, &self.config, MessageKind::Err, text.as_bytes());
    }
}

fn send_message(
    tx: &mpsc::UnboundedSender<LogMessage>,
    config: &LogConfig,
    kind: MessageKind,
    bytes: &[u8],
) {
    let message = LogMessage {
        app_guid: config.app_guid.clone(),
        source_name: config.source_name.clone(),
        source_id: config.index.unwrap_or(0),
        kind,
        message: String::from_utf8_lossy(bytes).into_owned(),
        timestamp_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
    };
    // A closed sink only means we are shutting down; drop the line
    let _ = tx.send(message);
}

/// Line-buffering writer attached to one process stream
pub struct LogWriter {
    config: LogConfig,
    kind: MessageKind,
    tx: mpsc::UnboundedSender<LogMessage>,
    buf: Vec<u8>,
}

impl LogWriter {
    fn new(config: LogConfig, kind: MessageKind, tx: mpsc::UnboundedSender<LogMessage>) -> Self {
        Self {
            config,
            kind,
            tx,
            buf: Vec::new(),
        }
    }

    fn ingest(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                self.emit(&line[..line.len() - 1]);
            } else if self.buf.len() >= MAX_MESSAGE_SIZE {
                let chunk: Vec<u8> = self.buf.drain(..MAX_MESSAGE_SIZE).collect();
                self.emit(&chunk);
            } else {
                break;
            }
        }
    }

    fn flush_residual(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
    }

    fn emit(&self, bytes: &[u8]) {
        send_message(&self.tx, &self.config, self.kind, bytes);
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.flush_residual();
    }
}

impl AsyncWrite for LogWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.ingest(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flush_residual();
        Poll::Ready(Ok(()))
    }
}

/// Encode one message as a signed, length-prefixed frame:
/// `u32 big-endian payload length | 32-byte signature | JSON body`,
/// where the signature is SHA-256 over `secret || body`.
pub fn encode_frame(message: &LogMessage, secret: &str) -> Vec<u8> {
    let body = serde_json::to_vec(message).expect("log messages serialize");
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(&body);
    let signature = hasher.finalize();

    let payload_len = (signature.len() + body.len()) as u32;
    let mut frame = Vec::with_capacity(4 + payload_len as usize);
    frame.extend_from_slice(&payload_len.to_be_bytes());
    frame.extend_from_slice(&signature);
    frame.extend_from_slice(&body);
    frame
}

/// Decode and verify a frame produced by [`encode_frame`]
pub fn decode_frame(frame: &[u8], secret: &str) -> Option<LogMessage> {
    if frame.len() < 4 + 32 {
        return None;
    }
    let payload_len = u32::from_be_bytes(frame[..4].try_into().ok()?) as usize;
    let payload = frame.get(4..4 + payload_len)?;
    let (signature, body) = payload.split_at(32);

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    if hasher.finalize().as_slice() != signature {
        return None;
    }
    serde_json::from_slice(body).ok()
}

/// Forward framed messages to the UDP log sink until the channel closes
pub async fn run_udp_forwarder(
    mut rx: mpsc::UnboundedReceiver<LogMessage>,
    address: String,
    secret: String,
) {
    let socket = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind log forwarder socket");
            return;
        }
    };

    tracing::info!(sink = %address, "Log forwarder started");
    while let Some(message) = rx.recv().await {
        let frame = encode_frame(&message, &secret);
        if let Err(e) = socket.send_to(&frame, &address).await {
            tracing::debug!(error = %e, "Dropped log frame");
        }
    }
    tracing::info!("Log forwarder stopped");
}
