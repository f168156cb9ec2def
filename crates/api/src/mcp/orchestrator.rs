//! Orchestrator: thin façade between the bridge and the session manager
//!
//! Turns `(project, server_ref, request)` into acquire → invoke → release,
//! translates transport errors into the public taxonomy, and enforces tool
//! auto-approval. Aggregation fans one list request out to every enabled
//! backend of a project and merges the results with name prefixing; a failing
//! backend is isolated into an `errors` entry instead of failing the call.

use std::sync::Arc;

use futures::future::join_all;
use time::OffsetDateTime;

use gateway_shared::{BackendServer, ProjectId, SessionKey};

use super::namespace;
use super::session::{Session, SessionManager};
use super::types::{
    AggregatedPromptsResult, AggregatedResourcesResult, AggregatedToolsResult, BackendError,
    JsonRpcRequest, JsonRpcResponse, PromptsListResult, ResourcesListResult, ToolsListResult,
};
use crate::error::{ApiError, ApiResult};
use crate::registry::ServerRegistry;

/// Identity attached to one inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub authenticated: bool,
    pub caller: Option<String>,
}

/// Decides whether a non-auto-approved tool call may proceed. The real
/// policy (interactive approval, project rules) lives outside the gateway;
/// the default forwards everything and leaves a trace.
pub trait ApprovalPolicy: Send + Sync {
    fn allow(&self, project_id: ProjectId, server: &str, tool: &str) -> bool;
}

/// Forward every tool call, logging the ones that bypassed auto-approval.
pub struct AllowAllPolicy;

impl ApprovalPolicy for AllowAllPolicy {
    fn allow(&self, project_id: ProjectId, server: &str, tool: &str) -> bool {
        tracing::debug!(
            project_id = %project_id,
            server = %server,
            tool = %tool,
            "Tool call not in auto-approve list; default policy forwards it"
        );
        true
    }
}

pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    registry: Arc<ServerRegistry>,
    approval: Arc<dyn ApprovalPolicy>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ServerRegistry>,
        approval: Arc<dyn ApprovalPolicy>,
    ) -> Self {
        Self {
            sessions,
            registry,
            approval,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Forward one request to one backend. The returned response carries the
    /// caller's original id, and the key names the session it went through
    /// so the bridge can wire up notification forwarding.
    pub async fn dispatch(
        &self,
        project_id: ProjectId,
        server_ref: &str,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> ApiResult<(JsonRpcResponse, SessionKey)> {
        let handle = self.sessions.acquire(project_id, server_ref).await?;
        let session = handle.session();
        let key = session.key();

        if session.jwt_required().resolve(None) && !ctx.authenticated {
            return Err(ApiError::Unauthorized);
        }
        check_failure_backoff(session)?;

        if request.method == "tools/call" {
            let tool = request
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(|n| n.as_str())
                .ok_or_else(|| ApiError::BadRequest("tools/call without a tool name".into()))?;
            if !session.is_auto_approved(tool)
                && !self.approval.allow(project_id, session.server_name(), tool)
            {
                return Err(ApiError::NotApproved(tool.to_string()));
            }
        }

        let client_id = request.id.clone();
        let timeout = session.timeout();
        let mut response = session.invoke(&request.method, request.params, timeout).await?;
        response.id = client_id;

        Ok((response, key))
    }

    /// Backends eligible for fan-out right now
    async fn fanout_targets(&self, project_id: ProjectId) -> ApiResult<Vec<BackendServer>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .registry
            .list_enabled(project_id)
            .await?
            .into_iter()
            .filter(|server| server.is_available(now))
            .collect())
    }

    /// `tools/list` across every enabled backend, merged with the backend
    /// name prefixed onto each tool. Results are cached on the live session
    /// and invalidated with it. Also reports the keys of every session the
    /// fan-out routed through, so the bridge can wire notifications.
    pub async fn aggregate_tools(
        &self,
        project_id: ProjectId,
        ctx: &RequestContext,
    ) -> ApiResult<(AggregatedToolsResult, Vec<SessionKey>)> {
        let servers = self.fanout_targets(project_id).await?;
        let calls = servers.into_iter().map(|server| {
            let name = server.name.clone();
            let key = server.key();
            async move {
                let result = self.list_tools_on(server, ctx).await;
                (name, key, result)
            }
        });

        let mut tools = Vec::new();
        let mut errors = Vec::new();
        let mut touched = Vec::new();
        for (name, key, result) in join_all(calls).await {
            match result {
                Ok(server_tools) => {
                    tools.extend(namespace::prefix_tools(&name, server_tools));
                    touched.push(key);
                }
                Err(e) => {
                    tracing::warn!(project_id = %project_id, server = %name, error = %e,
                        "Backend failed during tools/list fan-out");
                    errors.push(BackendError {
                        server: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok((AggregatedToolsResult { tools, errors }, touched))
    }

    async fn list_tools_on(
        &self,
        server: BackendServer,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<super::types::Tool>> {
        if server.jwt_required.resolve(None) && !ctx.authenticated {
            return Err(ApiError::Unauthorized);
        }
        let handle = self.sessions.acquire_resolved(server).await?;
        let session = handle.session();
        check_failure_backoff(session)?;

        if let Some(cached) = session.cached_tools() {
            return Ok(cached);
        }

        let timeout = session.timeout();
        let response = session
            .invoke("tools/list", Some(serde_json::json!({})), timeout)
            .await?;
        let result: ToolsListResult = parse_result(response)?;
        session.cache_tools(result.tools.clone());
        Ok(result.tools)
    }

    /// `resources/list` fan-out with URI prefixing
    pub async fn aggregate_resources(
        &self,
        project_id: ProjectId,
        ctx: &RequestContext,
    ) -> ApiResult<(AggregatedResourcesResult, Vec<SessionKey>)> {
        let servers = self.fanout_targets(project_id).await?;
        let calls = servers.into_iter().map(|server| {
            let name = server.name.clone();
            let key = server.key();
            async move {
                let result = self.list_on::<ResourcesListResult>(server, "resources/list", ctx).await;
                (name, key, result)
            }
        });

        let mut resources = Vec::new();
        let mut errors = Vec::new();
        let mut touched = Vec::new();
        for (name, key, result) in join_all(calls).await {
            match result {
                Ok(r) => {
                    resources.extend(namespace::prefix_resources(&name, r.resources));
                    touched.push(key);
                }
                Err(e) => errors.push(BackendError {
                    server: name,
                    error: e.to_string(),
                }),
            }
        }
        Ok((AggregatedResourcesResult { resources, errors }, touched))
    }

    /// `prompts/list` fan-out with name prefixing
    pub async fn aggregate_prompts(
        &self,
        project_id: ProjectId,
        ctx: &RequestContext,
    ) -> ApiResult<(AggregatedPromptsResult, Vec<SessionKey>)> {
        let servers = self.fanout_targets(project_id).await?;
        let calls = servers.into_iter().map(|server| {
            let name = server.name.clone();
            let key = server.key();
            async move {
                let result = self.list_on::<PromptsListResult>(server, "prompts/list", ctx).await;
                (name, key, result)
            }
        });

        let mut prompts = Vec::new();
        let mut errors = Vec::new();
        let mut touched = Vec::new();
        for (name, key, result) in join_all(calls).await {
            match result {
                Ok(r) => {
                    prompts.extend(namespace::prefix_prompts(&name, r.prompts));
                    touched.push(key);
                }
                Err(e) => errors.push(BackendError {
                    server: name,
                    error: e.to_string(),
                }),
            }
        }
        Ok((AggregatedPromptsResult { prompts, errors }, touched))
    }

    async fn list_on<T: serde::de::DeserializeOwned>(
        &self,
        server: BackendServer,
        method: &str,
        ctx: &RequestContext,
    ) -> ApiResult<T> {
        if server.jwt_required.resolve(None) && !ctx.authenticated {
            return Err(ApiError::Unauthorized);
        }
        let handle = self.sessions.acquire_resolved(server).await?;
        let session = handle.session();
        check_failure_backoff(session)?;
        let timeout = session.timeout();
        let response = session
            .invoke(method, Some(serde_json::json!({})), timeout)
            .await?;
        parse_result(response)
    }
}

/// Skip a backend whose failure streak has tripped the breaker. Fan-out
/// callers turn this into an `errors` entry; single dispatch surfaces it on
/// the channel. The backoff window in the session admits a test call once
/// it elapses.
fn check_failure_backoff(session: &Session) -> ApiResult<()> {
    if session.is_call_permitted() {
        return Ok(());
    }
    let last_error = session
        .last_error()
        .unwrap_or_else(|| "unknown error".to_string());
    tracing::warn!(
        key = %session.key(),
        server = %session.server_name(),
        failures = session.failure_streak(),
        last_error = %last_error,
        "Skipping backend in failure backoff"
    );
    Err(ApiError::TransportGone(format!(
        "backend suspended after {} consecutive failures: {}",
        session.failure_streak(),
        last_error
    )))
}

/// Unwrap a JSON-RPC response into its typed result, surfacing backend
/// errors as transport-level failures of this request.
fn parse_result<T: serde::de::DeserializeOwned>(response: JsonRpcResponse) -> ApiResult<T> {
    if let Some(error) = response.error {
        return Err(ApiError::BadRequest(error.message));
    }
    let result = response
        .result
        .ok_or_else(|| ApiError::BadRequest("response without result".into()))?;
    serde_json::from_value(result)
        .map_err(|e| ApiError::BadRequest(format!("malformed backend result: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::session::SessionManagerConfig;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use gateway_shared::{CryptoEnvelope, JwtRequirement, ServerId, TransportConfig};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct DenyAllPolicy {
        consulted: AtomicUsize,
    }

    impl ApprovalPolicy for DenyAllPolicy {
        fn allow(&self, _project_id: ProjectId, _server: &str, _tool: &str) -> bool {
            self.consulted.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn stub_server(project: ProjectId, auto_approve: Vec<String>) -> BackendServer {
        // Answers initialize (id 1), then any request with a fixed id-2 result
        let script = r#"
            read line
            printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub","version":"0"}}}'
            read initialized
            while read line; do
                printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[],"isError":false}}'
            done
        "#;
        BackendServer {
            id: ServerId::new(),
            project_id: project,
            name: "fs".to_string(),
            display_name: None,
            description: None,
            transport: TransportConfig::Stdio {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: HashMap::new(),
                cwd: None,
            },
            enabled: true,
            disabled_until: None,
            timeout: Duration::from_secs(5),
            auto_approve_tools: auto_approve,
            jwt_required: JwtRequirement::Disabled,
        }
    }

    fn test_components(policy: Arc<dyn ApprovalPolicy>) -> (Orchestrator, Arc<SessionManager>) {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/gateway_test_unused")
            .expect("lazy pool");
        let crypto =
            Arc::new(CryptoEnvelope::from_base64_key(&BASE64.encode([5u8; 32])).unwrap());
        let registry = Arc::new(ServerRegistry::new(pool, crypto));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            SessionManagerConfig {
                idle_timeout: Duration::from_secs(1800),
                default_timeout: Duration::from_secs(5),
                max_frame_bytes: 4 * 1024 * 1024,
            },
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&sessions), registry, policy);
        (orchestrator, sessions)
    }

    #[tokio::test]
    async fn test_denied_tool_call_is_rejected() {
        let policy = Arc::new(DenyAllPolicy {
            consulted: AtomicUsize::new(0),
        });
        let (orchestrator, sessions) = test_components(policy.clone());
        let project = ProjectId::new();
        let server = stub_server(project, vec![]);

        // Warm the session cache so dispatch finds it by name
        let session = sessions.get_or_create(server).await.unwrap();
        assert_eq!(session.server_name(), "fs");

        // The name alias is only learned through the registry; dispatch by id
        let server_ref = session.key().server_id.to_string();
        let request = JsonRpcRequest::new(
            crate::mcp::types::JsonRpcId::Number(1),
            "tools/call",
            serde_json::json!({"name": "rm_rf", "arguments": {}}),
        );

        let result = orchestrator
            .dispatch(project, &server_ref, request, &RequestContext::default())
            .await;
        assert!(matches!(result, Err(ApiError::NotApproved(_))));
        assert_eq!(policy.consulted.load(Ordering::SeqCst), 1);

        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_approved_tool_skips_policy() {
        let policy = Arc::new(DenyAllPolicy {
            consulted: AtomicUsize::new(0),
        });
        let (orchestrator, sessions) = test_components(policy.clone());
        let project = ProjectId::new();
        let server = stub_server(project, vec!["read_file".to_string()]);

        let session = sessions.get_or_create(server).await.unwrap();
        let server_ref = session.key().server_id.to_string();

        let request = JsonRpcRequest::new(
            crate::mcp::types::JsonRpcId::Number(9),
            "tools/call",
            serde_json::json!({"name": "read_file", "arguments": {"path": "/tmp"}}),
        );
        let (response, key) = orchestrator
            .dispatch(project, &server_ref, request, &RequestContext::default())
            .await
            .unwrap();

        // Policy never consulted; response re-carries the caller's id
        assert_eq!(policy.consulted.load(Ordering::SeqCst), 0);
        assert_eq!(response.id, Some(crate::mcp::types::JsonRpcId::Number(9)));
        assert_eq!(key.project_id, project);

        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_jwt_required_server_rejects_unauthenticated() {
        let policy = Arc::new(AllowAllPolicy);
        let (orchestrator, sessions) = test_components(policy);
        let project = ProjectId::new();
        let mut server = stub_server(project, vec![]);
        server.jwt_required = JwtRequirement::Required;

        let session = sessions.get_or_create(server).await.unwrap();
        let server_ref = session.key().server_id.to_string();

        let request = JsonRpcRequest::new(
            crate::mcp::types::JsonRpcId::Number(1),
            "tools/list",
            serde_json::json!({}),
        );

        let denied = orchestrator
            .dispatch(project, &server_ref, request.clone(), &RequestContext::default())
            .await;
        assert!(matches!(denied, Err(ApiError::Unauthorized)));

        let allowed = orchestrator
            .dispatch(
                project,
                &server_ref,
                request,
                &RequestContext {
                    authenticated: true,
                    caller: Some("tester".into()),
                },
            )
            .await;
        assert!(allowed.is_ok());

        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_in_failure_backoff_is_skipped() {
        let (orchestrator, sessions) = test_components(Arc::new(AllowAllPolicy));
        let project = ProjectId::new();

        // Answers initialize, then goes silent so every call times out
        let script = r#"
            read line
            printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mute","version":"0"}}}'
            while read line; do :; done
        "#;
        let mut server = stub_server(project, vec![]);
        server.transport = TransportConfig::Stdio {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            cwd: None,
        };
        let server_ref = server.id.to_string();

        // Trip the breaker with timed-out calls
        for _ in 0..5 {
            let handle = sessions.acquire_resolved(server.clone()).await.unwrap();
            let _ = handle
                .session()
                .invoke("tools/call", None, Duration::from_millis(20))
                .await;
        }

        let request = JsonRpcRequest::new(
            crate::mcp::types::JsonRpcId::Number(1),
            "tools/list",
            serde_json::json!({}),
        );
        let result = orchestrator
            .dispatch(project, &server_ref, request, &RequestContext::default())
            .await;
        match result {
            Err(ApiError::TransportGone(message)) => {
                assert!(message.contains("suspended"), "unexpected: {}", message);
                assert!(message.contains("timed out"), "unexpected: {}", message);
            }
            other => panic!("expected suspension, got {:?}", other.map(|_| ())),
        }

        sessions.shutdown().await;
    }

    #[test]
    fn test_parse_result_propagates_backend_error() {
        let response = JsonRpcResponse::error(
            None,
            crate::mcp::types::JsonRpcError::internal_error("backend exploded"),
        );
        let result: ApiResult<ToolsListResult> = parse_result(response);
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
