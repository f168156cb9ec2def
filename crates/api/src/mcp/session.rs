//! Session manager: cache, reference-count, and evict live backend sessions
//!
//! One live session per `(project, server)` key. Concurrent acquires for an
//! absent key coalesce into a single transport construction (per-key
//! singleflight, not a global mutex); everyone else waits on the first
//! caller's outcome. Sessions are reference-counted with an inflight count
//! so idle eviction can never race an active request, and any transport
//! failure removes the entry atomically so the next request rebuilds.
//!
//! The key table lock is held only for map operations, never across I/O;
//! construction, handshakes, and drains all run with the lock released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch, Mutex};

use gateway_shared::{BackendServer, JwtRequirement, ProjectId, ServerId, SessionKey, TransportConfig};

use super::transport::{SseTransport, StdioTransport, Transport, TransportError};
use super::types::{InitializeResult, JsonRpcId, JsonRpcRequest, JsonRpcResponse, Tool};
use crate::error::{ApiError, ApiResult};
use crate::registry::ServerRegistry;

/// How long an eviction waits for inflight requests to finish
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Polling step while waiting for inflight to reach zero
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Consecutive failures before a session goes into backoff
const FAILURE_THRESHOLD: u32 = 5;

/// Backoff window bounds once the threshold is crossed
const FAILURE_MIN_BACKOFF: Duration = Duration::from_secs(1);
const FAILURE_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Draining,
    Dead,
}

/// Why a session is being evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    Dead,
    Shutdown,
}

/// Tunables for the session manager
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub idle_timeout: Duration,
    pub default_timeout: Duration,
    pub max_frame_bytes: usize,
}

// =============================================================================
// Session
// =============================================================================

/// One live transport plus handshake state, bound to a single backend for a
/// single project. Owned exclusively by the session manager; everyone else
/// holds short-lived [`SessionHandle`]s.
pub struct Session {
    key: SessionKey,
    server_name: String,
    auto_approve_tools: Vec<String>,
    jwt_required: JwtRequirement,
    timeout: Duration,
    transport: Arc<Transport>,
    init: InitializeResult,
    created_at: Instant,
    last_used: StdMutex<Instant>,
    inflight: AtomicUsize,
    next_id: AtomicI64,
    draining: AtomicBool,
    tools_cache: StdMutex<Option<Vec<Tool>>>,
    consecutive_failures: AtomicU32,
    last_error: StdMutex<Option<String>>,
    last_failure_at: StdMutex<Option<Instant>>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn jwt_required(&self) -> JwtRequirement {
        self.jwt_required
    }

    pub fn is_auto_approved(&self, tool: &str) -> bool {
        self.auto_approve_tools.iter().any(|t| t == tool)
    }

    /// Negotiated initialize result from the backend
    pub fn init_result(&self) -> &InitializeResult {
        &self.init
    }

    pub fn state(&self) -> SessionState {
        if self.transport.shared().is_dead() {
            SessionState::Dead
        } else if self.draining.load(Ordering::SeqCst) {
            SessionState::Draining
        } else {
            SessionState::Ready
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().expect("last_used lock poisoned").elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Subscribe to server-initiated notifications in arrival order
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcRequest> {
        self.transport.shared().subscribe()
    }

    /// Cached tools/list result, valid for the life of this session
    pub fn cached_tools(&self) -> Option<Vec<Tool>> {
        self.tools_cache
            .lock()
            .expect("tools cache lock poisoned")
            .clone()
    }

    pub fn cache_tools(&self, tools: Vec<Tool>) {
        *self.tools_cache.lock().expect("tools cache lock poisoned") = Some(tools);
    }

    fn try_acquire(self: &Arc<Self>) -> Option<SessionHandle> {
        if self.state() != SessionState::Ready {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        // Re-check: a drain may have started between the state check and the
        // increment. Backing out keeps the eviction interlock exact.
        if self.draining.load(Ordering::SeqCst) || self.transport.shared().is_dead() {
            self.release_ref();
            return None;
        }
        Some(SessionHandle {
            session: Arc::clone(self),
            released: false,
        })
    }

    fn release_ref(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // A negative inflight count is a bug, not a runtime condition.
            tracing::error!(key = %self.key, "inflight count underflow");
            std::process::abort();
        }
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    fn cancel_drain(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    fn next_request_id(&self) -> JsonRpcId {
        JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Forward one JSON-RPC request and await its response.
    ///
    /// Requests submitted in program order on one handle hit the wire in that
    /// order; responses are matched by id and may return out of order. On
    /// deadline the pending sink is freed and a cancellation notification is
    /// sent to the backend.
    pub async fn invoke(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: Duration,
    ) -> ApiResult<JsonRpcResponse> {
        let id = self.next_request_id();
        let rx = self
            .transport
            .shared()
            .register(id.clone())
            .map_err(|e| self.transport_gone(e))?;

        let mut guard = PendingGuard {
            transport: Arc::clone(&self.transport),
            id: id.clone(),
            armed: true,
            notify_cancel: false,
        };

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        };
        self.transport
            .send(&request)
            .await
            .map_err(|e| self.transport_gone(e))?;
        // The request reached the backend; from here a dropped wait must
        // tell the backend to stop working on it.
        guard.notify_cancel = true;

        let response = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => {
                guard.armed = false;
                response
            }
            Ok(Err(_)) => {
                guard.armed = false;
                let reason = self
                    .transport
                    .shared()
                    .death_reason()
                    .unwrap_or_else(|| "connection lost".to_string());
                self.record_failure(&reason);
                return Err(ApiError::TransportGone(reason));
            }
            Err(_) => {
                // Guard drop removes the sink and notifies the backend
                self.record_failure(&format!("{} timed out after {:?}", method, deadline));
                return Err(ApiError::Timeout);
            }
        };

        self.touch();
        self.record_success();
        Ok(response)
    }

    pub fn failure_streak(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Most recent invoke failure, kept for skip logging
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("last_error lock poisoned")
            .clone()
    }

    /// Whether the failure breaker admits a call right now. Below the
    /// threshold everything passes; past it, one test call gets through each
    /// time the exponential backoff window elapses.
    pub fn is_call_permitted(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures < FAILURE_THRESHOLD {
            return true;
        }
        let last_failure = *self
            .last_failure_at
            .lock()
            .expect("last_failure_at lock poisoned");
        match last_failure {
            Some(at) => {
                // Exponent capped: anything larger saturates at the max
                // backoff anyway
                let exponent = failures.saturating_sub(FAILURE_THRESHOLD).min(6);
                let backoff =
                    (FAILURE_MIN_BACKOFF * 2u32.pow(exponent)).min(FAILURE_MAX_BACKOFF);
                at.elapsed() >= backoff
            }
            None => true,
        }
    }

    fn record_failure(&self, error: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_error.lock().expect("last_error lock poisoned") = Some(error.to_string());
        *self
            .last_failure_at
            .lock()
            .expect("last_failure_at lock poisoned") = Some(Instant::now());
        if failures == FAILURE_THRESHOLD {
            tracing::warn!(
                key = %self.key,
                server = %self.server_name,
                failures,
                error = %error,
                "Backend entering failure backoff"
            );
        }
    }

    fn record_success(&self) {
        if self.consecutive_failures.swap(0, Ordering::SeqCst) >= FAILURE_THRESHOLD {
            tracing::info!(key = %self.key, server = %self.server_name, "Backend recovered");
        }
        *self.last_error.lock().expect("last_error lock poisoned") = None;
        *self
            .last_failure_at
            .lock()
            .expect("last_failure_at lock poisoned") = None;
    }

    fn transport_gone(&self, e: TransportError) -> ApiError {
        self.record_failure(&e.to_string());
        match e {
            TransportError::Timeout => ApiError::Timeout,
            other => ApiError::TransportGone(other.to_string()),
        }
    }
}

/// Removes the pending sink if the awaiting side gives up, and tells the
/// backend to stop working on requests that already hit the wire.
struct PendingGuard {
    transport: Arc<Transport>,
    id: JsonRpcId,
    armed: bool,
    notify_cancel: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.transport.shared().remove(&self.id);
        if self.notify_cancel && !self.transport.shared().is_dead() {
            let transport = Arc::clone(&self.transport);
            let request_id = match &self.id {
                JsonRpcId::Number(n) => serde_json::json!(n),
                JsonRpcId::String(s) => serde_json::json!(s),
                JsonRpcId::Null => serde_json::Value::Null,
            };
            // Drop can run outside a runtime during teardown; skip the
            // courtesy cancel there.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let cancel = JsonRpcRequest::notification(
                        "notifications/cancelled",
                        Some(serde_json::json!({
                            "requestId": request_id,
                            "reason": "caller went away",
                        })),
                    );
                    let _ = transport.send(&cancel).await;
                });
            }
        }
    }
}

/// Borrowed reference to a live session. Holding one pins the session
/// against eviction; it must not outlive a single request or stream. Dropping
/// it releases the reference.
pub struct SessionHandle {
    session: Arc<Session>,
    released: bool,
}

impl SessionHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(mut self) {
        self.session.release_ref();
        self.released = true;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.released {
            self.session.release_ref();
        }
    }
}

// =============================================================================
// Session manager
// =============================================================================

/// Init outcome shared with singleflight waiters. Waiters see the message of
/// a failed construction; the winner keeps the typed error.
type InitSignal = watch::Receiver<Option<Result<Arc<Session>, String>>>;

#[derive(Clone)]
enum Slot {
    Ready(Arc<Session>),
    Initializing(InitSignal),
    Draining(watch::Receiver<bool>),
}

/// Process-wide cache of live backend sessions
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionKey, Slot>>,
    // Name → id aliases so the hot path never touches the registry
    names: StdMutex<HashMap<(ProjectId, String), ServerId>>,
    registry: Arc<ServerRegistry>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(registry: Arc<ServerRegistry>, config: SessionManagerConfig) -> Self {
        tracing::info!(
            idle_timeout = ?config.idle_timeout,
            default_timeout = ?config.default_timeout,
            "Session manager initialized"
        );
        Self {
            sessions: Mutex::new(HashMap::new()),
            names: StdMutex::new(HashMap::new()),
            registry,
            config,
        }
    }

    /// Resolve `server_ref` to a session key without touching the registry.
    /// Returns None when the ref is an unknown name.
    fn candidate_key(&self, project_id: ProjectId, server_ref: &str) -> Option<SessionKey> {
        if let Ok(id) = uuid::Uuid::parse_str(server_ref) {
            return Some(SessionKey::new(project_id, ServerId(id)));
        }
        self.names
            .lock()
            .expect("name cache lock poisoned")
            .get(&(project_id, server_ref.to_string()))
            .map(|id| SessionKey::new(project_id, *id))
    }

    /// Acquire a handle on the live session for `(project, server_ref)`,
    /// constructing it if needed. The registry is consulted only on a miss.
    pub async fn acquire(&self, project_id: ProjectId, server_ref: &str) -> ApiResult<SessionHandle> {
        loop {
            if let Some(key) = self.candidate_key(project_id, server_ref) {
                let slot = { self.sessions.lock().await.get(&key).cloned() };
                match slot {
                    Some(Slot::Ready(session)) => {
                        if let Some(handle) = session.try_acquire() {
                            return Ok(handle);
                        }
                        match session.state() {
                            SessionState::Dead => {
                                self.remove_dead(key, &session).await;
                                continue;
                            }
                            _ => {
                                // Draining; the drain loop below will signal
                                tokio::time::sleep(DRAIN_POLL).await;
                                continue;
                            }
                        }
                    }
                    Some(Slot::Initializing(rx)) => {
                        match self.await_init(rx).await? {
                            Some(session) => {
                                if let Some(handle) = session.try_acquire() {
                                    return Ok(handle);
                                }
                                continue;
                            }
                            None => continue,
                        }
                    }
                    Some(Slot::Draining(rx)) => {
                        self.await_drain(rx).await;
                        continue;
                    }
                    None => {}
                }
            }

            // Miss: resolve through the registry, then construct
            let server = self.registry.get(project_id, server_ref).await?;
            if !server.is_available(OffsetDateTime::now_utc()) {
                return Err(ApiError::ServerDisabled(server.name));
            }
            self.names
                .lock()
                .expect("name cache lock poisoned")
                .insert((project_id, server.name.clone()), server.id);

            return self.acquire_resolved(server).await;
        }
    }

    /// Acquire a handle for a server already resolved through the registry.
    pub async fn acquire_resolved(&self, server: BackendServer) -> ApiResult<SessionHandle> {
        loop {
            let session = self.get_or_create(server.clone()).await?;
            if let Some(handle) = session.try_acquire() {
                return Ok(handle);
            }
            match session.state() {
                SessionState::Dead => {
                    self.remove_dead(server.key(), &session).await;
                }
                _ => tokio::time::sleep(DRAIN_POLL).await,
            }
        }
    }

    /// Get the live session for an already-resolved server, constructing it
    /// with at-most-one concurrent construction per key.
    pub async fn get_or_create(&self, server: BackendServer) -> ApiResult<Arc<Session>> {
        let key = server.key();
        loop {
            let install = {
                let mut sessions = self.sessions.lock().await;
                match sessions.get(&key).cloned() {
                    Some(slot) => Err(slot),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        sessions.insert(key, Slot::Initializing(rx));
                        Ok(tx)
                    }
                }
            };

            let tx = match install {
                Ok(tx) => tx,
                Err(Slot::Ready(session)) => match session.state() {
                    SessionState::Ready => return Ok(session),
                    SessionState::Dead => {
                        self.remove_dead(key, &session).await;
                        continue;
                    }
                    SessionState::Draining => {
                        tokio::time::sleep(DRAIN_POLL).await;
                        continue;
                    }
                },
                Err(Slot::Initializing(rx)) => match self.await_init(rx).await? {
                    Some(session) => return Ok(session),
                    None => continue,
                },
                Err(Slot::Draining(rx)) => {
                    self.await_drain(rx).await;
                    continue;
                }
            };

            // This caller won the singleflight; build with the lock released.
            let built = self.build_session(server).await;
            {
                let mut sessions = self.sessions.lock().await;
                match &built {
                    Ok(session) => {
                        sessions.insert(key, Slot::Ready(Arc::clone(session)));
                    }
                    Err(_) => {
                        // Failed constructions are not cached; the next
                        // request retries from scratch.
                        sessions.remove(&key);
                    }
                }
            }
            let _ = tx.send(Some(
                built
                    .as_ref()
                    .map(Arc::clone)
                    .map_err(|e| e.to_string()),
            ));
            return built;
        }
    }

    /// Wait on another caller's in-flight construction.
    /// Returns Ok(None) when the slot vanished and the caller should retry.
    async fn await_init(&self, mut rx: InitSignal) -> ApiResult<Option<Arc<Session>>> {
        let outcome = tokio::time::timeout(self.config.default_timeout, async {
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return Some(outcome);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .map_err(|_| ApiError::Timeout)?;

        match outcome {
            Some(Ok(session)) => Ok(Some(session)),
            Some(Err(message)) => Err(ApiError::Init(message)),
            None => Ok(None),
        }
    }

    async fn await_drain(&self, mut rx: watch::Receiver<bool>) {
        let _ = tokio::time::timeout(DRAIN_GRACE + Duration::from_secs(1), async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
    }

    async fn build_session(&self, server: BackendServer) -> ApiResult<Arc<Session>> {
        let key = server.key();
        let timeout = server.timeout;

        let transport = match &server.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => Transport::Stdio(
                StdioTransport::connect(
                    &server.name,
                    command,
                    args,
                    env,
                    cwd.as_deref(),
                    self.config.max_frame_bytes,
                )
                .map_err(|e| ApiError::Init(e.to_string()))?,
            ),
            TransportConfig::Sse { url, headers } => Transport::Sse(
                SseTransport::connect(&server.name, url, headers, timeout)
                    .await
                    .map_err(|e| ApiError::Init(e.to_string()))?,
            ),
        };
        let transport = Arc::new(transport);

        // The session becomes Ready only after a successful handshake; a
        // timeout or error response tears the transport down again.
        let init = match transport.initialize(JsonRpcId::Number(1), timeout).await {
            Ok(init) => init,
            Err(e) => {
                transport.drain().await;
                tracing::warn!(key = %key, error = %e, "Backend handshake failed");
                return Err(ApiError::Init(e.to_string()));
            }
        };

        tracing::info!(
            key = %key,
            server = %server.name,
            transport = transport.kind_name(),
            protocol = %init.protocol_version,
            backend = %init.server_info.name,
            "Session ready"
        );

        Ok(Arc::new(Session {
            key,
            server_name: server.name,
            auto_approve_tools: server.auto_approve_tools,
            jwt_required: server.jwt_required,
            timeout,
            transport,
            init,
            created_at: Instant::now(),
            last_used: StdMutex::new(Instant::now()),
            inflight: AtomicUsize::new(0),
            next_id: AtomicI64::new(2),
            draining: AtomicBool::new(false),
            tools_cache: StdMutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            last_error: StdMutex::new(None),
            last_failure_at: StdMutex::new(None),
        }))
    }

    async fn remove_dead(&self, key: SessionKey, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(Slot::Ready(current)) if Arc::ptr_eq(current, session) => {
                    sessions.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::warn!(
                key = %key,
                reason = ?session.transport.shared().death_reason(),
                "Removed dead session"
            );
            session.transport.drain().await;
        }
    }

    /// Evict one session. Idle evictions bail out if inflight requests do
    /// not drain within the grace period; dead and shutdown evictions always
    /// complete. Returns whether the entry was removed.
    pub async fn evict(&self, key: SessionKey, reason: EvictReason) -> bool {
        let (session, done_tx) = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key).cloned() {
                Some(Slot::Ready(session)) => {
                    let (tx, rx) = watch::channel(false);
                    sessions.insert(key, Slot::Draining(rx));
                    (session, tx)
                }
                _ => return false,
            }
        };
        session.begin_drain();

        let deadline = Instant::now() + DRAIN_GRACE;
        while session.inflight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        if session.inflight() > 0 && reason == EvictReason::Idle {
            // Still busy: an acquire slipped in before the drain flag. The
            // inflight interlock wins; put the session back.
            session.cancel_drain();
            let mut sessions = self.sessions.lock().await;
            sessions.insert(key, Slot::Ready(session));
            drop(sessions);
            let _ = done_tx.send(true);
            return false;
        }

        session.transport.drain().await;
        self.sessions.lock().await.remove(&key);
        let _ = done_tx.send(true);

        tracing::info!(key = %key, reason = ?reason, "Session evicted");
        true
    }

    /// One janitor pass: remove dead sessions immediately, drain sessions
    /// idle past the threshold with no inflight requests.
    pub async fn sweep(&self) {
        let snapshot: Vec<(SessionKey, Arc<Session>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(session) => Some((*key, Arc::clone(session))),
                    _ => None,
                })
                .collect()
        };

        for (key, session) in snapshot {
            match session.state() {
                SessionState::Dead => {
                    self.evict(key, EvictReason::Dead).await;
                }
                SessionState::Ready
                    if session.idle_for() >= self.config.idle_timeout
                        && session.inflight() == 0 =>
                {
                    self.evict(key, EvictReason::Idle).await;
                }
                _ => {}
            }
        }
    }

    /// Drain everything; used at shutdown.
    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().copied().collect()
        };
        for key in keys {
            self.evict(key, EvictReason::Shutdown).await;
        }
        tracing::info!("Session manager stopped");
    }

    /// Notification stream of a live session, if any
    pub async fn subscribe(&self, key: SessionKey) -> Option<broadcast::Receiver<JsonRpcRequest>> {
        let sessions = self.sessions.lock().await;
        match sessions.get(&key) {
            Some(Slot::Ready(session)) => Some(session.subscribe()),
            _ => None,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }
}
