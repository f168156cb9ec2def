//! Transport adapters for backend MCP servers
//!
//! Two wire shapes, one operation set. A transport owns the connection to a
//! single backend (a child process for stdio, an HTTP stream pair for SSE)
//! and demultiplexes inbound frames: responses are matched to pending
//! request sinks by JSON-RPC id, everything else fans out to notification
//! subscribers in arrival order.
//!
//! Writes are serialized behind one writer lock per transport so request
//! bytes never interleave. Reads happen on a dedicated reader task that is
//! never blocked by a writer. Any transport-level failure (EOF, decode
//! error, write failure, oversized frame) marks the transport dead and fails
//! every pending request; the session manager then drops the session and
//! rebuilds it on the next request.

pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{broadcast, oneshot, watch};

use super::types::{
    Capabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcId, JsonRpcRequest,
    JsonRpcResponse, RootsCapability, PROTOCOL_VERSION,
};

pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Notification fan-out buffer per transport
const NOTIFICATION_BUFFER: usize = 256;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Process spawn failed: {0}")]
    Spawn(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// State shared between a transport's reader task and its callers.
///
/// The pending map is a plain mutex held only for map operations, never
/// across I/O; sinks are completed or dropped while the lock is released.
pub struct TransportShared {
    pending: Mutex<HashMap<JsonRpcId, oneshot::Sender<JsonRpcResponse>>>,
    notify_tx: broadcast::Sender<JsonRpcRequest>,
    dead_tx: watch::Sender<Option<String>>,
    dead_rx: watch::Receiver<Option<String>>,
}

impl TransportShared {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let (dead_tx, dead_rx) = watch::channel(None);
        Self {
            pending: Mutex::new(HashMap::new()),
            notify_tx,
            dead_tx,
            dead_rx,
        }
    }

    /// Register a response sink for a request id. Fails immediately when the
    /// transport is already dead.
    pub fn register(&self, id: JsonRpcId) -> TransportResult<oneshot::Receiver<JsonRpcResponse>> {
        if let Some(reason) = self.death_reason() {
            return Err(TransportError::Closed(reason));
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);
        Ok(rx)
    }

    /// Remove a pending sink (request cancelled or timed out)
    pub fn remove(&self, id: &JsonRpcId) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
    }

    /// Route an inbound response to its waiting sink
    pub fn complete(&self, response: JsonRpcResponse) {
        let sink = match &response.id {
            Some(id) => self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(id),
            None => None,
        };
        match sink {
            Some(tx) => {
                // Receiver may have given up (deadline); that's fine.
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(id = ?response.id, "Dropping response with no pending sink");
            }
        }
    }

    /// Deliver a server-initiated notification to subscribers
    pub fn notify(&self, notification: JsonRpcRequest) {
        // No subscribers is not an error
        let _ = self.notify_tx.send(notification);
    }

    /// Subscribe to server-initiated notifications in arrival order
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcRequest> {
        self.notify_tx.subscribe()
    }

    /// Mark the transport dead and fail all pending requests. Idempotent;
    /// the first reason wins.
    pub fn mark_dead(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.dead_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        // Dropping the senders wakes every waiting invoke with a closed
        // channel, which callers surface as TransportGone.
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!(
                pending = drained.len(),
                reason = %reason,
                "Failing pending requests on dead transport"
            );
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead_rx.borrow().is_some()
    }

    pub fn death_reason(&self) -> Option<String> {
        self.dead_rx.borrow().clone()
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}

impl Default for TransportShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Demultiplex one inbound frame: a message with an id and a result or error
/// is a response; everything else is a notification (or a server-initiated
/// request, which the gateway does not answer and forwards as-is).
pub fn demux_frame(shared: &TransportShared, raw: &str) -> TransportResult<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;

    let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let is_response = has_id && (value.get("result").is_some() || value.get("error").is_some());

    if is_response {
        let response: JsonRpcResponse = serde_json::from_value(value)?;
        shared.complete(response);
    } else {
        let notification: JsonRpcRequest = serde_json::from_value(value)?;
        shared.notify(notification);
    }
    Ok(())
}

/// Sealed transport variant. Both arms expose the same operation set; only
/// the wire differs.
pub enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
}

impl Transport {
    /// Write one JSON-RPC message, serialized behind the transport's writer
    /// lock. Program-order sends on one caller are written in that order.
    pub async fn send(&self, message: &JsonRpcRequest) -> TransportResult<()> {
        match self {
            Transport::Stdio(t) => t.send(message).await,
            Transport::Sse(t) => t.send(message).await,
        }
    }

    /// Shared demux state (pending sinks, notification stream, death flag)
    pub fn shared(&self) -> &TransportShared {
        match self {
            Transport::Stdio(t) => t.shared(),
            Transport::Sse(t) => t.shared(),
        }
    }

    /// Gracefully shut the transport down. Safe to call on a dead transport;
    /// it still reaps resources.
    pub async fn drain(&self) {
        match self {
            Transport::Stdio(t) => t.drain().await,
            Transport::Sse(t) => t.drain().await,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "stdio",
            Transport::Sse(_) => "sse",
        }
    }

    /// Run the MCP initialization handshake: send `initialize`, await the
    /// server's answer within `timeout`, then send the `initialized`
    /// notification. The session only becomes ready after this succeeds.
    pub async fn initialize(
        &self,
        id: JsonRpcId,
        timeout: std::time::Duration,
    ) -> TransportResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities {
                roots: Some(RootsCapability { list_changed: true }),
                sampling: Some(serde_json::json!({})),
                ..Default::default()
            },
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let request = JsonRpcRequest::new(id.clone(), "initialize", serde_json::to_value(params)?);

        let rx = self.shared().register(id.clone())?;
        if let Err(e) = self.send(&request).await {
            self.shared().remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(TransportError::Closed(
                    self.shared()
                        .death_reason()
                        .unwrap_or_else(|| "connection lost during handshake".to_string()),
                ))
            }
            Err(_) => {
                self.shared().remove(&id);
                return Err(TransportError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(TransportError::Handshake(error.message));
        }
        let result: InitializeResult =
            serde_json::from_value(response.result.ok_or(TransportError::InvalidResponse)?)?;

        let initialized = JsonRpcRequest::notification("notifications/initialized", None);
        self.send(&initialized).await?;

        Ok(result)
    }
}
