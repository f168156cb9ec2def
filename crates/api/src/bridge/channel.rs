//! Client channels: one per open SSE stream
//!
//! A channel owns the outbound event queue for one connected client and the
//! set of backend sessions it listens to. Channels never outlive their SSE
//! stream: when the stream drops, every subscription is unregistered and
//! every in-flight dispatch is cancelled, which in turn tells the backends
//! to stop working on those requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use gateway_shared::{ChannelId, ProjectId, SessionKey};

use crate::error::{ApiError, ApiResult};
use crate::mcp::SessionManager;

/// Outbound queue capacity per channel; a full queue is the backpressure
/// signal from a slow SSE client.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Channel lifecycle: Opening → Open → Closing → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// One live SSE stream held open for one client
pub struct ClientChannel {
    pub id: ChannelId,
    pub project_id: ProjectId,
    pub caller: Option<String>,
    tx: mpsc::Sender<serde_json::Value>,
    state: StdMutex<ChannelState>,
    subscriptions: Mutex<HashMap<SessionKey, JoinHandle<()>>>,
    dispatches: StdMutex<Vec<JoinHandle<()>>>,
    pub opened_at: Instant,
}

impl ClientChannel {
    /// Create a channel and hand back the receiving half of its outbound
    /// queue for the SSE stream to drain.
    pub fn new(
        project_id: ProjectId,
        caller: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<serde_json::Value>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let channel = Arc::new(Self {
            id: ChannelId::new(),
            project_id,
            caller,
            tx,
            state: StdMutex::new(ChannelState::Opening),
            subscriptions: Mutex::new(HashMap::new()),
            dispatches: StdMutex::new(Vec::new()),
            opened_at: Instant::now(),
        });
        (channel, rx)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel state lock poisoned")
    }

    pub fn mark_open(&self) {
        let mut state = self.state.lock().expect("channel state lock poisoned");
        if *state == ChannelState::Opening {
            *state = ChannelState::Open;
        }
    }

    /// Queue headroom check used by the POST handler to signal backpressure
    /// before accepting a message.
    pub fn has_capacity(&self) -> bool {
        self.tx.capacity() > 0
    }

    /// Enqueue one outbound message, waiting for queue space. Fails once the
    /// channel is closing.
    pub async fn enqueue(&self, message: serde_json::Value) -> ApiResult<()> {
        if !matches!(self.state(), ChannelState::Opening | ChannelState::Open) {
            return Err(ApiError::ChannelClosing);
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| ApiError::ChannelClosing)
    }

    /// Bind this channel to a backend session's notification stream. Every
    /// server-initiated notification on that session is forwarded as a
    /// `message` event in arrival order. Idempotent per session key.
    pub async fn subscribe_session(self: &Arc<Self>, key: SessionKey, sessions: &SessionManager) {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&key) {
            return;
        }
        let Some(mut rx) = sessions.subscribe(key).await else {
            return;
        };

        let channel = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        let Ok(value) = serde_json::to_value(&notification) else {
                            continue;
                        };
                        if channel.enqueue(value).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            channel_id = %channel.id,
                            key = %key,
                            missed,
                            "Slow channel dropped notifications"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        subscriptions.insert(key, handle);

        tracing::debug!(channel_id = %self.id, key = %key, "Channel subscribed to session");
    }

    /// Track an in-flight dispatch so channel close can cancel it
    pub fn track_dispatch(&self, handle: JoinHandle<()>) {
        let mut dispatches = self.dispatches.lock().expect("dispatch list lock poisoned");
        dispatches.retain(|h| !h.is_finished());
        dispatches.push(handle);
    }

    /// Close the channel: cancel every in-flight dispatch (failing their
    /// requests and cancelling backend work) and unregister every
    /// subscription. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().expect("channel state lock poisoned");
            if matches!(*state, ChannelState::Closing | ChannelState::Closed) {
                return;
            }
            *state = ChannelState::Closing;
        }

        let pending: Vec<JoinHandle<()>> = {
            let mut dispatches = self.dispatches.lock().expect("dispatch list lock poisoned");
            dispatches.drain(..).collect()
        };
        for handle in pending {
            handle.abort();
        }

        let subscriptions: Vec<(SessionKey, JoinHandle<()>)> = {
            let mut subs = self.subscriptions.lock().await;
            subs.drain().collect()
        };
        for (_, handle) in subscriptions {
            handle.abort();
        }

        *self.state.lock().expect("channel state lock poisoned") = ChannelState::Closed;
        tracing::info!(
            channel_id = %self.id,
            project_id = %self.project_id,
            open_for = ?self.opened_at.elapsed(),
            "Client channel closed"
        );
    }

    #[cfg(test)]
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_lifecycle() {
        let (channel, _rx) = ClientChannel::new(ProjectId::new(), None);
        assert_eq!(channel.state(), ChannelState::Opening);

        channel.mark_open();
        assert_eq!(channel.state(), ChannelState::Open);

        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);

        // Idempotent
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_enqueue_delivers_in_order() {
        let (channel, mut rx) = ClientChannel::new(ProjectId::new(), None);
        channel.mark_open();

        channel.enqueue(serde_json::json!({"seq": 1})).await.unwrap();
        channel.enqueue(serde_json::json!({"seq": 2})).await.unwrap();

        assert_eq!(rx.recv().await.unwrap()["seq"], 1);
        assert_eq!(rx.recv().await.unwrap()["seq"], 2);
    }

    #[tokio::test]
    async fn test_enqueue_fails_after_close() {
        let (channel, _rx) = ClientChannel::new(ProjectId::new(), None);
        channel.mark_open();
        channel.close().await;

        let result = channel.enqueue(serde_json::json!({})).await;
        assert!(matches!(result, Err(ApiError::ChannelClosing)));
    }

    #[tokio::test]
    async fn test_capacity_signal() {
        let (channel, mut rx) = ClientChannel::new(ProjectId::new(), None);
        channel.mark_open();
        assert!(channel.has_capacity());

        for i in 0..OUTBOUND_QUEUE_CAPACITY {
            channel.enqueue(serde_json::json!({"seq": i})).await.unwrap();
        }
        assert!(!channel.has_capacity());

        // Draining one event restores headroom; the channel stays open
        rx.recv().await.unwrap();
        assert!(channel.has_capacity());
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_close_cancels_tracked_dispatches() {
        let (channel, _rx) = ClientChannel::new(ProjectId::new(), None);
        channel.mark_open();

        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        channel.track_dispatch(handle);

        channel.close().await;
        // Give the abort a moment to land
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let dispatches = channel.dispatches.lock().unwrap();
        assert!(dispatches.is_empty());
    }
}
