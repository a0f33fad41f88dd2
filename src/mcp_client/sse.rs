//! JSON-RPC over an HTTP event stream (MCP SSE transport).
//!
//! The client opens a long-lived `GET` on the provider URL. The provider's
//! first `endpoint` event names the URL requests are `POST`ed to; responses
//! come back asynchronously as `message` events on the stream and are routed
//! to the waiting caller by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client as HttpClient, Url};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{next_request_id, Transport};
use super::types::{JsonRpcRequest, JsonRpcResponse, ProviderSpec};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

// ─── Event Parsing ───────────────────────────────────────────────────────────

/// A single server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (`message` when the server omits it).
    pub event: String,
    pub data: String,
}

/// Parse one raw event block (the text between blank lines).
///
/// Returns `None` for comments and keep-alives that carry no data.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = value.to_string(),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// Incremental reader that splits an HTTP byte stream on SSE boundaries.
struct EventReader {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    /// Raw bytes; a multi-byte character may straddle two chunks.
    buffer: Vec<u8>,
}

impl EventReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            bytes: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            buffer: Vec::new(),
        }
    }

    /// Next complete event, `Ok(None)` when the stream ends.
    async fn next_event(&mut self) -> Result<Option<SseEvent>, String> {
        loop {
            if let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
                let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
                match parse_event(&String::from_utf8_lossy(&block[..end])) {
                    Some(event) => return Ok(Some(event)),
                    None => continue, // keep-alive or comment
                }
            }

            match self.bytes.next().await {
                // CR only ever appears as part of a line ending.
                Some(Ok(chunk)) => {
                    self.buffer.extend(chunk.into_iter().filter(|&b| b != b'\r'));
                }
                Some(Err(e)) => return Err(format!("stream read error: {e}")),
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    return Ok(parse_event(String::from_utf8_lossy(&rest).trim()));
                }
            }
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Transport to a provider reachable as a URL-addressed event stream.
pub struct SseTransport {
    provider: String,
    http: HttpClient,
    endpoint: Url,
    pending: PendingMap,
    stream_open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the provider's `endpoint` event.
    ///
    /// Connection refusal, HTTP errors and a stream that ends before the
    /// endpoint is announced all surface as `ConnectFailed`.
    pub async fn connect(spec: &ProviderSpec) -> Result<Self, McpError> {
        let connect_failed = |reason: String| McpError::ConnectFailed {
            provider: spec.name.clone(),
            reason,
        };

        let stream_url = Url::parse(&spec.target)
            .map_err(|e| connect_failed(format!("invalid url '{}': {e}", spec.target)))?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| connect_failed(format!("failed to build HTTP client: {e}")))?;

        let response = http
            .get(stream_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| connect_failed(format!("{e}")))?;

        if !response.status().is_success() {
            return Err(connect_failed(format!("HTTP {}", response.status())));
        }

        let mut events = EventReader::new(response);
        let endpoint = loop {
            match events.next_event().await {
                Ok(Some(event)) if event.event == "endpoint" => {
                    break stream_url.join(event.data.trim()).map_err(|e| {
                        connect_failed(format!("invalid endpoint '{}': {e}", event.data))
                    })?;
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(connect_failed("stream ended before endpoint event".into()))
                }
                Err(reason) => return Err(connect_failed(reason)),
            }
        };

        tracing::debug!(provider = %spec.name, endpoint = %endpoint, "event stream established");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stream_open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(route_responses(
            spec.name.clone(),
            events,
            Arc::clone(&pending),
            Arc::clone(&stream_open),
        ));

        Ok(Self {
            provider: spec.name.clone(),
            http,
            endpoint,
            pending,
            stream_open,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// URL requests are posted to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            provider: self.provider.clone(),
            reason,
        }
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| self.transport_error(format!("failed to post message: {e}")))?;

        if !response.status().is_success() {
            return Err(self.transport_error(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    fn abort_reader(&self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Reader task: forward `message` events to whoever awaits that id.
async fn route_responses(
    provider: String,
    mut events: EventReader,
    pending: PendingMap,
    stream_open: Arc<AtomicBool>,
) {
    loop {
        match events.next_event().await {
            Ok(Some(event)) if event.event == "message" => {
                let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&event.data) else {
                    tracing::trace!(provider = %provider, "ignoring non-response message");
                    continue;
                };
                let Some(id) = resp.numeric_id() else { continue };
                let waiter = pending.lock().ok().and_then(|mut map| map.remove(&id));
                if let Some(tx) = waiter {
                    let _ = tx.send(resp);
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                tracing::debug!(provider = %provider, "event stream ended");
                break;
            }
            Err(reason) => {
                tracing::warn!(provider = %provider, reason = %reason, "event stream failed");
                break;
            }
        }
    }

    stream_open.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed-channel error.
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
}

/// Removes a pending entry if the request future is dropped early.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.id);
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if !self.stream_open.load(Ordering::SeqCst) {
            return Err(self.transport_error("event stream closed".into()));
        }

        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|e| self.transport_error(format!("pending map poisoned: {e}")))?
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        rx.await
            .map_err(|_| self.transport_error("event stream closed before response".into()))
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.post(&JsonRpcRequest::notification(method, params)).await
    }

    /// Single-phase close: stop the reader and drop the stream.
    async fn close(&self, _grace: Duration) -> Result<(), McpError> {
        self.stream_open.store(false, Ordering::SeqCst);
        self.abort_reader();
        if let Ok(mut map) = self.pending.lock() {
            map.clear();
        }
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
