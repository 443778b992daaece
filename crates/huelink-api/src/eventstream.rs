//! Server-sent event stream with auto-reconnect.
//!
//! Opens the bridge's `/eventstream/clip/v2` endpoint and forwards parsed
//! messages through a bounded [`tokio::sync::mpsc`] channel, so a slow
//! consumer stalls reading rather than buffering without limit. The
//! connection has no read timeout and is re-established forever, with at
//! least [`ReconnectConfig::min_interval`] between attempts, until the
//! cancellation token fires. A line longer than [`MAX_LINE_BYTES`] drops
//! the connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use huelink_api::eventstream::{EventStreamHandle, ReconnectConfig, StreamEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! let (handle, mut rx) =
//!     EventStreamHandle::spawn(client, ReconnectConfig::default(), CancellationToken::new());
//!
//! while let Some(event) = rx.recv().await {
//!     if let StreamEvent::Messages(batch) = event {
//!         for msg in batch.iter().filter(|m| m.is_update()) {
//!             println!("{} items in {}", msg.data.len(), msg.id);
//!         }
//!     }
//! }
//!
//! handle.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, HeaderValue};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{APPLICATION_KEY_HEADER, BridgeClient};
use crate::error::{Error, RequestFailure};
use crate::v2::raw_url;

/// Bridge path of the CLIP v2 event stream.
pub const EVENT_STREAM_PATH: &str = "/eventstream/clip/v2";

/// Longest SSE line accepted before the connection is dropped.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Events buffered between the reader and its consumer.
const EVENT_BUFFER: usize = 64;

const DATA_PREFIX: &[u8] = b"data: ";

// ── StreamMessage ────────────────────────────────────────────────────

/// One message from a `data:` line.
///
/// A line carries a JSON array of these; each `data` item is a partial
/// resource (`id`, `type`, plus the changed fields).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Batch id assigned by the bridge.
    pub id: String,

    /// `"update"`, `"add"`, `"delete"`, `"error"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// RFC 3339 creation time of the batch.
    #[serde(default)]
    pub creationtime: Option<String>,

    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

impl StreamMessage {
    pub fn is_update(&self) -> bool {
        self.kind == "update"
    }

    /// Parsed `creationtime`, if present and well formed.
    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creationtime
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

// ── StreamEvent ──────────────────────────────────────────────────────

/// What the background loop reports to its consumer.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The bridge accepted the stream request.
    Connected,
    /// Messages parsed from one complete `data:` line.
    Messages(Vec<StreamMessage>),
    /// The connection ended or could not be established.
    Disconnected { reason: String },
}

// ── ReconnectConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Minimum time between the starts of two connection attempts. Default: 5s.
    pub min_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
        }
    }
}

// ── EventStreamHandle ────────────────────────────────────────────────

/// Handle to a running event-stream task.
pub struct EventStreamHandle {
    cancel: CancellationToken,
}

impl EventStreamHandle {
    /// Spawn the reconnect loop and return the receiving end of its events.
    ///
    /// The first connection attempt happens asynchronously. The loop ends
    /// when `cancel` fires or the receiver is dropped.
    pub fn spawn(
        client: Arc<BridgeClient>,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            stream_loop(client, event_tx, reconnect, task_cancel).await;
        });

        (Self { cancel }, event_rx)
    }

    /// Signal the background task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// connect → read until the stream drops → wait out the interval → reconnect.
async fn stream_loop(
    client: Arc<BridgeClient>,
    event_tx: mpsc::Sender<StreamEvent>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u64 = 0;

    loop {
        let started = Instant::now();
        attempt += 1;

        let reason = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_read(&client, &event_tx) => match result {
                Ok(()) => "stream ended".to_owned(),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "event stream error");
                    e.to_string()
                }
            },
        };

        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = event_tx.send(StreamEvent::Disconnected { reason }) => sent,
        };
        if sent.is_err() {
            break;
        }

        let wait_until = started + reconnect.min_interval;
        tracing::debug!(
            attempt,
            delay_ms = u64::try_from(
                wait_until.saturating_duration_since(Instant::now()).as_millis()
            )
            .unwrap_or(u64::MAX),
            "waiting before event stream reconnect"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(wait_until) => {}
        }
    }

    tracing::debug!("event stream loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Open one stream connection and forward messages until it drops.
///
/// A closed receiver ends the connection cleanly.
async fn connect_and_read(
    client: &BridgeClient,
    event_tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), Error> {
    let mut resp = client.open_event_stream().await?;

    tracing::info!(url = %resp.url(), "event stream connected");
    if event_tx.send(StreamEvent::Connected).await.is_err() {
        return Ok(());
    }

    let read_failed = |description: String| {
        Error::from(RequestFailure::new(
            reqwest::Method::GET,
            raw_url(client, EVENT_STREAM_PATH),
            None,
            description,
        ))
    };

    let mut lines = LineBuffer::default();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| read_failed(format!("Event stream read failed: {e}")))?
    {
        let complete = lines
            .push(&chunk)
            .map_err(|e| read_failed(format!("Event stream read failed: {e}")))?;
        for line in complete {
            let Some(messages) = parse_data_line(&line) else {
                continue;
            };
            if event_tx.send(StreamEvent::Messages(messages)).await.is_err() {
                return Ok(());
            }
        }
    }

    tracing::info!("event stream ended");
    Ok(())
}

impl BridgeClient {
    /// Issue the event-stream request and return the open response.
    ///
    /// Uses the stream client, which has no whole-request timeout.
    pub async fn open_event_stream(&self) -> Result<reqwest::Response, Error> {
        let url = self.url(EVENT_STREAM_PATH)?;
        let fail = |description: String| {
            RequestFailure::new(reqwest::Method::GET, url.as_str(), None, description)
        };

        let resp = self
            .stream_http()
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(APPLICATION_KEY_HEADER, self.key_header())
            .send()
            .await
            .map_err(|e| fail(format!("Transport error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("Server returned HTTP {status}")).into());
        }
        Ok(resp)
    }
}

// ── Framing ──────────────────────────────────────────────────────────

/// A line grew past the buffer's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("line exceeded {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Accumulates raw bytes and yields complete lines.
///
/// Works on bytes so a multi-byte character split across two chunks is
/// only decoded once the line is whole.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    /// Append a chunk and drain every complete line (without its `\n` or `\r\n`).
    ///
    /// Fails, discarding everything buffered, once a line is longer than
    /// the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            if pos > self.limit {
                return Err(self.overflow());
            }
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        if self.pending.len() > self.limit {
            return Err(self.overflow());
        }
        Ok(lines)
    }

    fn overflow(&mut self) -> LineTooLong {
        self.pending = Vec::new();
        LineTooLong { limit: self.limit }
    }

    /// Bytes received after the last complete line.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Parse one SSE line into messages.
///
/// Returns `None` for non-`data:` lines and for payloads that are not a
/// JSON array. Individual malformed messages are dropped.
pub fn parse_data_line(line: &str) -> Option<Vec<StreamMessage>> {
    let payload = line.as_bytes().strip_prefix(DATA_PREFIX)?;

    let items: Vec<serde_json::Value> = match serde_json::from_slice(payload) {
        Ok(items) => items,
        Err(e) => {
            tracing::debug!(error = %e, "unparsable event stream payload");
            return None;
        }
    };

    let messages = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<StreamMessage>(item) {
            Ok(msg) => Some(msg),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed event stream message");
                None
            }
        })
        .collect();
    Some(messages)
}

// ── Tests ────────────────────────────────────────────────────────────
