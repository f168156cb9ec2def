//! HTTP endpoints for the SSE bridge

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use gateway_shared::{ChannelId, ProjectId};

use super::{handle_message, ChannelState, ClientChannel};
use crate::auth;
use crate::error::{ApiError, ApiResult};
use crate::mcp::types::JsonRpcRequest;
use crate::state::AppState;

/// Keepalive cadence on client streams
const PING_INTERVAL: Duration = Duration::from_secs(15);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/projects/:project_id/unified/sse", get(unified_sse))
        .route("/projects/:project_id/unified/messages", post(unified_messages))
        .route("/projects/:project_id/unified/messages/", post(unified_messages))
        .with_state(state)
}

// =============================================================================
// SSE stream endpoint
// =============================================================================

/// Closes and deregisters the channel when the client's SSE stream drops,
/// whichever way it drops.
struct ChannelGuard {
    state: AppState,
    channel: Arc<ClientChannel>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let channels = Arc::clone(&self.state.channels);
        let channel = Arc::clone(&self.channel);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                channel.close().await;
                channels.remove(&channel.id).await;
            });
        }
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: ChannelGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Open a client SSE stream for a project. The first event is `endpoint`
/// with the POST URL for this channel; everything after is `message` events
/// in queue order, with `ping` keepalives.
pub async fn unified_sse(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let ctx = auth::context_from_headers(&state.config, &headers)?;
    let project_id = ProjectId(project_id);

    let (channel, rx) = ClientChannel::new(project_id, ctx.caller);
    state.channels.add(Arc::clone(&channel)).await;
    channel.mark_open();

    let endpoint = format!(
        "/projects/{}/unified/messages/?channel_id={}",
        project_id, channel.id
    );
    let endpoint_event = Event::default().event("endpoint").data(endpoint);

    let guard = ChannelGuard {
        state: state.clone(),
        channel: Arc::clone(&channel),
    };

    let messages = ReceiverStream::new(rx)
        .map(|payload| Ok(Event::default().event("message").data(payload.to_string())));
    let stream = GuardedStream {
        inner: stream::iter([Ok(endpoint_event)]).chain(messages),
        _guard: guard,
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(PING_INTERVAL)
            .event(Event::default().event("ping").data("")),
    ))
}

// =============================================================================
// Message intake endpoint
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub channel_id: Uuid,
}

/// Accept one JSON-RPC message for a channel. The POST only acknowledges
/// intake (202); the answer arrives as a `message` event on the channel's
/// SSE stream.
pub async fn unified_messages(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let ctx = auth::context_from_headers(&state.config, &headers)?;
    let project_id = ProjectId(project_id);

    let channel = state
        .channels
        .get(&ChannelId(query.channel_id))
        .await
        .ok_or(ApiError::ChannelNotFound)?;
    if channel.project_id != project_id {
        return Err(ApiError::ChannelNotFound);
    }
    match channel.state() {
        ChannelState::Opening | ChannelState::Open => {}
        ChannelState::Closing | ChannelState::Closed => return Err(ApiError::ChannelClosing),
    }

    let request: JsonRpcRequest = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed JSON-RPC message: {}", e)))?;
    if request.jsonrpc != "2.0" {
        return Err(ApiError::BadRequest(format!(
            "unsupported JSON-RPC version: {}",
            request.jsonrpc
        )));
    }

    // A full outbound queue means the client is not draining its stream;
    // push back instead of buffering without bound. The channel stays open.
    if !channel.has_capacity() {
        return Err(ApiError::Backpressure);
    }

    let task = tokio::spawn(handle_message(
        state.clone(),
        Arc::clone(&channel),
        request,
        ctx,
    ));
    channel.track_dispatch(task);

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

// =============================================================================
// Health endpoints
// =============================================================================

#[derive(serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub sessions: usize,
    pub channels: usize,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "healthy".to_string(),
        Err(_) => "unhealthy".to_string(),
    };

    let overall = if db_status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall,
        Json(HealthResponse {
            status: if overall == StatusCode::OK {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status,
            sessions: state.sessions.session_count().await,
            channels: state.channels.count().await,
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe (checks if the service is ready to accept traffic)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
