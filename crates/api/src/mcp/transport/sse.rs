//! SSE transport: outbound HTTP stream pair to a remote MCP server
//!
//! One long-lived GET yields the server's event stream; short-lived POSTs
//! carry JSON-RPC requests. The remote's first `endpoint` event names the
//! POST URL; until it arrives the transport is still initializing.
//!
//! There is no transparent reconnect. A lost stream marks the transport dead
//! so the session manager drops the entry and builds a fresh remote session
//! on the next request, keeping observability honest: a new remote session
//! never hides under an old key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{demux_frame, TransportError, TransportResult, TransportShared};
use crate::mcp::types::JsonRpcRequest;

/// One parsed server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE wire parser. Chunk boundaries from the network bear no
/// relation to event boundaries, so state lives across `feed` calls.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: String,
    event_type: String,
    data_lines: Vec<String>,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stream bytes; returns every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line dispatches the accumulated event
                if !self.data_lines.is_empty() {
                    let event = if self.event_type.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event_type)
                    };
                    events.push(SseEvent {
                        event,
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                } else {
                    self.event_type.clear();
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event_type = value.trim_start().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim_start().to_string());
            } else if line.starts_with(':') {
                // Comment / keepalive
            }
            // Unknown fields (id:, retry:) are ignored
        }

        events
    }
}

/// Resolve the POST URL announced by the `endpoint` event against the
/// stream URL (it is typically relative, e.g. `/messages/?session_id=…`).
pub fn resolve_endpoint(base_url: &str, endpoint: &str) -> TransportResult<String> {
    let base = reqwest::Url::parse(base_url)
        .map_err(|e| TransportError::InvalidConfig(format!("invalid base url: {}", e)))?;
    let resolved = base
        .join(endpoint)
        .map_err(|e| TransportError::Handshake(format!("invalid endpoint event: {}", e)))?;
    Ok(resolved.to_string())
}

fn build_headers(configured: &HashMap<String, String>) -> TransportResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in configured {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidConfig(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidConfig(format!("invalid header value for {}", name)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// One live remote MCP server reachable over SSE + HTTP POST
pub struct SseTransport {
    shared: Arc<TransportShared>,
    client: reqwest::Client,
    post_url: String,
    headers: HeaderMap,
    // POST sends hold this across the request so request bytes of concurrent
    // callers never interleave on the wire.
    writer: Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    server_name: String,
}

impl SseTransport {
    /// Open the event stream and wait for the remote's `endpoint` event.
    pub async fn connect(
        server_name: &str,
        url: &str,
        configured_headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> TransportResult<Self> {
        let headers = build_headers(configured_headers)?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let response = client
            .get(url)
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Handshake(format!(
                "stream open returned HTTP {}",
                response.status()
            )));
        }

        let shared = Arc::new(TransportShared::new());
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let shared = Arc::clone(&shared);
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut parser = SseEventParser::new();
                let mut endpoint_tx = Some(endpoint_tx);

                while let Some(chunk) = stream.next().await {
                    let bytes = match chunk {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(server = %name, error = %e, "SSE stream read failed");
                            shared.mark_dead(format!("stream read failed: {}", e));
                            return;
                        }
                    };
                    let text = String::from_utf8_lossy(&bytes);

                    for event in parser.feed(&text) {
                        match event.event.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            "message" => {
                                if let Err(e) = demux_frame(&shared, &event.data) {
                                    tracing::error!(server = %name, error = %e, "SSE frame decode error");
                                    shared.mark_dead(format!("decode error: {}", e));
                                    return;
                                }
                            }
                            "ping" => {}
                            other => {
                                tracing::debug!(server = %name, event = %other, "Ignoring SSE event");
                            }
                        }
                    }
                }

                tracing::warn!(server = %name, "SSE stream closed by remote");
                shared.mark_dead("SSE stream closed by remote");
            })
        };

        // Initializing until the endpoint event names the POST URL
        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::Handshake(
                    shared
                        .death_reason()
                        .unwrap_or_else(|| "stream closed before endpoint event".to_string()),
                ));
            }
            Err(_) => {
                reader.abort();
                shared.mark_dead("no endpoint event before deadline");
                return Err(TransportError::Timeout);
            }
        };
        let post_url = resolve_endpoint(url, &endpoint)?;

        tracing::info!(
            server = %server_name,
            post_url = %post_url,
            "Connected to remote MCP server"
        );

        Ok(Self {
            shared,
            client,
            post_url,
            headers,
            writer: Mutex::new(()),
            reader: Mutex::new(Some(reader)),
            server_name: server_name.to_string(),
        })
    }

    pub fn shared(&self) -> &TransportShared {
        &self.shared
    }

    /// POST one JSON-RPC message to the remote's message endpoint. The
    /// response arrives on the event stream; the POST body is only an ack,
    /// though servers that answer inline are tolerated.
    pub async fn send(&self, message: &JsonRpcRequest) -> TransportResult<()> {
        if let Some(reason) = self.shared.death_reason() {
            return Err(TransportError::Closed(reason));
        }

        let _write = self.writer.lock().await;
        let result = self
            .client
            .post(&self.post_url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(message)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.shared.mark_dead(format!("POST failed: {}", e));
                return Err(TransportError::Closed(format!("POST failed: {}", e)));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            self.shared
                .mark_dead(format!("POST returned HTTP {}", status));
            return Err(TransportError::Closed(format!(
                "POST returned HTTP {}",
                status
            )));
        }

        // Some servers answer the request inline instead of on the stream
        if let Ok(body) = response.text().await {
            let trimmed = body.trim();
            if trimmed.starts_with('{') {
                let _ = demux_frame(&self.shared, trimmed);
            }
        }

        Ok(())
    }

    /// Close the stream and fail pending requests. The remote session is not
    /// reusable afterwards.
    pub async fn drain(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.shared.mark_dead("transport drained");
        tracing::info!(server = %self.server_name, "Remote MCP session closed");
    }
}
