//! SSE bridge: the per-client endpoint pair
//!
//! A client opens `GET /projects/{project}/unified/sse` and receives an
//! `endpoint` event naming the POST URL for its fresh channel. Each POSTed
//! JSON-RPC message is acknowledged with 202 and answered asynchronously as
//! a `message` event on the stream. Responses and server-initiated
//! notifications share the channel's ordered outbound queue.

pub mod channel;
pub mod routes;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use gateway_shared::ChannelId;

use crate::error::ApiError;
use crate::mcp::namespace::{self, MethodKind};
use crate::mcp::types::{
    Capabilities, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    PromptsCapability, ResourcesCapability, ServerInfo, ToolsCapability, PROTOCOL_VERSION,
};
use crate::mcp::RequestContext;
use crate::state::AppState;

pub use channel::{ChannelState, ClientChannel, OUTBOUND_QUEUE_CAPACITY};

/// All open client channels, indexed by channel id
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<ClientChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, channel: Arc<ClientChannel>) {
        let mut channels = self.channels.write().await;
        channels.insert(channel.id, Arc::clone(&channel));
        tracing::info!(
            channel_id = %channel.id,
            project_id = %channel.project_id,
            total_channels = channels.len(),
            "Client channel opened"
        );
    }

    pub async fn get(&self, id: &ChannelId) -> Option<Arc<ClientChannel>> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &ChannelId) -> Option<Arc<ClientChannel>> {
        let mut channels = self.channels.write().await;
        let removed = channels.remove(id);
        if removed.is_some() {
            tracing::debug!(
                channel_id = %id,
                remaining_channels = channels.len(),
                "Client channel deregistered"
            );
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capabilities the gateway itself advertises to clients
fn gateway_initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: Capabilities {
            tools: Some(ToolsCapability::default()),
            resources: Some(ResourcesCapability::default()),
            prompts: Some(PromptsCapability::default()),
            ..Default::default()
        },
        server_info: ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        instructions: None,
    }
}

/// Process one inbound message and deliver its outcome onto the channel.
/// Runs as its own task; aborting it (channel close) cancels the backend
/// work through the session layer's pending-request guards.
pub async fn handle_message(
    state: AppState,
    channel: Arc<ClientChannel>,
    request: JsonRpcRequest,
    ctx: RequestContext,
) {
    let method = request.method.clone();
    let response = process_message(&state, &channel, request, &ctx).await;

    if let Some(response) = response {
        let Ok(payload) = serde_json::to_value(&response) else {
            return;
        };
        if let Err(e) = channel.enqueue(payload).await {
            tracing::debug!(
                channel_id = %channel.id,
                method = %method,
                error = %e,
                "Dropped response for closed channel"
            );
        }
    }
}

async fn process_message(
    state: &AppState,
    channel: &Arc<ClientChannel>,
    request: JsonRpcRequest,
    ctx: &RequestContext,
) -> Option<JsonRpcResponse> {
    let id = request.id.clone();
    let project_id = channel.project_id;

    match namespace::classify_method(&request.method) {
        MethodKind::BridgeHandled => {
            let result = match request.method.as_str() {
                "initialize" => serde_json::to_value(gateway_initialize_result()).ok()?,
                // "ping"
                _ => serde_json::json!({}),
            };
            Some(JsonRpcResponse::success(id, result))
        }

        MethodKind::Notification => {
            tracing::debug!(channel_id = %channel.id, method = %request.method, "Client notification");
            None
        }

        MethodKind::Aggregated => {
            let outcome = match request.method.as_str() {
                "tools/list" => state
                    .orchestrator
                    .aggregate_tools(project_id, ctx)
                    .await
                    .and_then(|(r, keys)| Ok((serde_json::to_value(r).map_err(|_| ApiError::Internal)?, keys))),
                "resources/list" => state
                    .orchestrator
                    .aggregate_resources(project_id, ctx)
                    .await
                    .and_then(|(r, keys)| Ok((serde_json::to_value(r).map_err(|_| ApiError::Internal)?, keys))),
                _ => state
                    .orchestrator
                    .aggregate_prompts(project_id, ctx)
                    .await
                    .and_then(|(r, keys)| Ok((serde_json::to_value(r).map_err(|_| ApiError::Internal)?, keys))),
            };

            match outcome {
                Ok((result, touched)) => {
                    for key in touched {
                        channel.subscribe_session(key, &state.sessions).await;
                    }
                    Some(JsonRpcResponse::success(id, result))
                }
                Err(e) => Some(JsonRpcResponse::error(id, e.to_json_rpc())),
            }
        }

        MethodKind::Routed => match route_request(request) {
            Ok((server_ref, rewritten)) => {
                match state
                    .orchestrator
                    .dispatch(project_id, &server_ref, rewritten, ctx)
                    .await
                {
                    Ok((response, key)) => {
                        channel.subscribe_session(key, &state.sessions).await;
                        Some(response)
                    }
                    Err(e) => Some(JsonRpcResponse::error(id, e.to_json_rpc())),
                }
            }
            Err(e) => Some(JsonRpcResponse::error(id, e.to_json_rpc())),
        },

        MethodKind::Unknown => {
            if id.is_none() {
                // Unknown notification; nothing to answer
                return None;
            }
            Some(JsonRpcResponse::error(
                id,
                JsonRpcError::method_not_found(&request.method),
            ))
        }
    }
}

/// Work out which backend a routed request targets, and rewrite the request
/// into the backend's own namespace. An explicit `params._server` pin wins;
/// otherwise the `{server}.{name}` prefix (or `mcp+{server}://` URI scheme)
/// decides.
fn route_request(request: JsonRpcRequest) -> Result<(String, JsonRpcRequest), ApiError> {
    let mut request = request;

    if let Some(server) = namespace::server_param(request.params.as_ref()) {
        request.params = namespace::strip_server_param(request.params);
        // A pinned request may still carry a prefixed tool name
        if let Some(params) = request.params.as_mut() {
            if let Some(name) = params.get("name").and_then(|n| n.as_str()) {
                if let Some(parsed) = namespace::parse_name(name) {
                    if parsed.server == server {
                        params["name"] = serde_json::Value::String(parsed.name);
                    }
                }
            }
        }
        return Ok((server, request));
    }

    let params = request
        .params
        .as_mut()
        .ok_or_else(|| ApiError::BadRequest("request names no backend server".into()))?;

    if let Some(name) = params.get("name").and_then(|n| n.as_str()) {
        let parsed = namespace::parse_name(name).ok_or_else(|| {
            ApiError::BadRequest(format!("name '{}' carries no server prefix", name))
        })?;
        params["name"] = serde_json::Value::String(parsed.name);
        return Ok((parsed.server, request));
    }

    if let Some(uri) = params.get("uri").and_then(|u| u.as_str()) {
        let parsed = namespace::parse_resource_uri(uri).ok_or_else(|| {
            ApiError::BadRequest(format!("uri '{}' carries no server prefix", uri))
        })?;
        params["uri"] = serde_json::Value::String(parsed.name);
        return Ok((parsed.server, request));
    }

    Err(ApiError::BadRequest(
        "request names no backend server".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::JsonRpcId;
    use serde_json::json;

    fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
        JsonRpcRequest::new(JsonRpcId::Number(1), method, params)
    }

    #[tokio::test]
    async fn test_registry_add_get_remove() {
        let registry = ChannelRegistry::new();
        let (channel, _rx) = ClientChannel::new(gateway_shared::ProjectId::new(), None);
        let id = channel.id;

        registry.add(Arc::clone(&channel)).await;
        assert_eq!(registry.count().await, 1);
        assert!(registry.get(&id).await.is_some());

        registry.remove(&id).await;
        assert_eq!(registry.count().await, 0);
        assert!(registry.get(&id).await.is_none());
    }

    #[test]
    fn test_route_by_server_param() {
        let req = request("tools/call", json!({"_server": "fs", "name": "read_file"}));
        let (server, rewritten) = route_request(req).unwrap();
        assert_eq!(server, "fs");
        let params = rewritten.params.unwrap();
        assert!(params.get("_server").is_none());
        assert_eq!(params["name"], "read_file");
    }

    #[test]
    fn test_route_by_prefixed_name() {
        let req = request("tools/call", json!({"name": "fs.read_file", "arguments": {}}));
        let (server, rewritten) = route_request(req).unwrap();
        assert_eq!(server, "fs");
        assert_eq!(rewritten.params.unwrap()["name"], "read_file");
    }

    #[test]
    fn test_route_pinned_with_prefixed_name() {
        let req = request(
            "tools/call",
            json!({"_server": "fs", "name": "fs.read_file"}),
        );
        let (server, rewritten) = route_request(req).unwrap();
        assert_eq!(server, "fs");
        assert_eq!(rewritten.params.unwrap()["name"], "read_file");
    }

    #[test]
    fn test_route_by_prefixed_uri() {
        let req = request("resources/read", json!({"uri": "mcp+db://postgres://users"}));
        let (server, rewritten) = route_request(req).unwrap();
        assert_eq!(server, "db");
        assert_eq!(rewritten.params.unwrap()["uri"], "postgres://users");
    }

    #[test]
    fn test_route_without_target_fails() {
        let req = request("tools/call", json!({"name": "unprefixed"}));
        assert!(matches!(route_request(req), Err(ApiError::BadRequest(_))));

        let req = request("completion/complete", json!({}));
        assert!(matches!(route_request(req), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_gateway_initialize_result_shape() {
        let result = gateway_initialize_result();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert!(result.capabilities.tools.is_some());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["protocolVersion"], PROTOCOL_VERSION);
    }
}
