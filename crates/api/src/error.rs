//! Gateway error taxonomy and HTTP/JSON-RPC mapping
//!
//! Everything except `Fatal` is recovered locally: the session manager heals
//! by rebuilding sessions, and clients see protocol-level errors they may
//! retry. `Fatal` is an invariant violation and aborts the process at the
//! detection site; it never travels through this type.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::mcp::types::JsonRpcError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No such backend server in the project
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Backend exists but is disabled
    #[error("Server is disabled: {0}")]
    ServerDisabled(String),

    /// Inbound bearer token missing or rejected
    #[error("Authentication required")]
    Unauthorized,

    /// Backend handshake failed; the session was not cached
    #[error("Backend initialization failed: {0}")]
    Init(String),

    /// Mid-session transport failure; the session was removed
    #[error("Backend transport gone: {0}")]
    TransportGone(String),

    /// Deadline exceeded; the request was cancelled on the backend
    #[error("Request timed out")]
    Timeout,

    /// Client channel outbound queue is full
    #[error("Channel backpressure")]
    Backpressure,

    /// Ciphertext tampered or wrong key; the server is treated as unavailable
    #[error("Stored configuration could not be decrypted")]
    Decrypt,

    /// Tool call rejected by the approval policy
    #[error("Tool call not approved: {0}")]
    NotApproved(String),

    // HTTP-layer errors on the bridge endpoints
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unknown channel")]
    ChannelNotFound,
    #[error("Channel is closing")]
    ChannelClosing,

    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    /// JSON-RPC error object for errors that surface on a client channel
    pub fn to_json_rpc(&self) -> JsonRpcError {
        match self {
            ApiError::ServerNotFound(_) | ApiError::ServerDisabled(_) => {
                JsonRpcError::new(JsonRpcError::SERVER_NOT_FOUND, self.to_string())
            }
            ApiError::Init(_) => JsonRpcError::new(JsonRpcError::INIT_ERROR, self.to_string()),
            ApiError::TransportGone(_) => {
                JsonRpcError::new(JsonRpcError::TRANSPORT_GONE, self.to_string())
            }
            ApiError::Timeout => JsonRpcError::new(JsonRpcError::TIMEOUT, self.to_string()),
            ApiError::Decrypt => JsonRpcError::new(JsonRpcError::DECRYPT_ERROR, self.to_string()),
            ApiError::NotApproved(_) => JsonRpcError::invalid_params(self.to_string()),
            ApiError::BadRequest(msg) => JsonRpcError::invalid_request(msg.clone()),
            _ => JsonRpcError::internal_error(self.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::ServerNotFound(_) => (StatusCode::NOT_FOUND, "SERVER_NOT_FOUND", self.to_string()),
            ApiError::ServerDisabled(_) => (StatusCode::NOT_FOUND, "SERVER_DISABLED", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Init(_) => (StatusCode::BAD_GATEWAY, "INIT_ERROR", self.to_string()),
            ApiError::TransportGone(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_GONE", self.to_string()),
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", self.to_string()),
            ApiError::Backpressure => (StatusCode::SERVICE_UNAVAILABLE, "BACKPRESSURE", self.to_string()),
            ApiError::Decrypt => (StatusCode::BAD_GATEWAY, "DECRYPT_ERROR", self.to_string()),
            ApiError::NotApproved(_) => (StatusCode::FORBIDDEN, "NOT_APPROVED", self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::ChannelNotFound => (StatusCode::NOT_FOUND, "CHANNEL_NOT_FOUND", self.to_string()),
            ApiError::ChannelClosing => (StatusCode::CONFLICT, "CHANNEL_CLOSING", self.to_string()),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        let mut response = (status, body).into_response();
        if matches!(self, ApiError::Backpressure) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::ServerNotFound("no matching row".to_string()),
            _ => ApiError::Database(err.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
