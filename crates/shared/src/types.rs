//! Common types used across the gateway

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Project (tenant) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ProjectId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Backend server ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ServerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Client channel ID wrapper (one per open SSE stream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Routing key for one live backend session.
///
/// This is the only session key representation in the codebase. String forms
/// (`"<project>/<server>"` and friends) are parsed at protocol boundaries and
/// converted here immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub project_id: ProjectId,
    pub server_id: ServerId,
}

impl SessionKey {
    pub fn new(project_id: ProjectId, server_id: ServerId) -> Self {
        Self {
            project_id,
            server_id,
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.server_id)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Transport used to reach a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            _ => Err(format!("Invalid transport kind: {}", s)),
        }
    }
}

/// Per-server JWT requirement
/// - Inherit: use the project default
/// - Required: requests must carry a verified bearer token
/// - Disabled: no token check for this server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JwtRequirement {
    Inherit,
    Required,
    Disabled,
}

impl Default for JwtRequirement {
    fn default() -> Self {
        Self::Inherit
    }
}

impl JwtRequirement {
    /// Resolve against the project default. An unresolvable inherit chain
    /// fails closed.
    pub fn resolve(&self, project_default: Option<bool>) -> bool {
        match self {
            Self::Required => true,
            Self::Disabled => false,
            Self::Inherit => project_default.unwrap_or(true),
        }
    }
}

impl std::str::FromStr for JwtRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "required" => Ok(Self::Required),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("Invalid jwt requirement: {}", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Backend server row as persisted in `mcp_servers`.
///
/// The `*_encrypted` columns hold crypto-envelope tokens; they are decrypted
/// by the registry on read and never leave the read path as ciphertext.
#[derive(Debug, Clone, FromRow)]
pub struct BackendServerRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub transport: String,
    pub enabled: bool,
    pub disabled_until: Option<OffsetDateTime>,
    pub timeout_ms: i64,
    pub auto_approve_tools: Vec<String>,
    pub jwt_required: String,
    // stdio
    pub command: Option<String>,
    pub args_encrypted: Option<String>,
    pub env_encrypted: Option<String>,
    pub cwd: Option<String>,
    // sse
    pub url: Option<String>,
    pub headers_encrypted: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Transport-specific configuration after decryption
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
        }
    }
}

/// Fully decrypted backend server definition
#[derive(Debug, Clone)]
pub struct BackendServer {
    pub id: ServerId,
    pub project_id: ProjectId,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub transport: TransportConfig,
    pub enabled: bool,
    pub disabled_until: Option<OffsetDateTime>,
    pub timeout: Duration,
    pub auto_approve_tools: Vec<String>,
    pub jwt_required: JwtRequirement,
}

impl BackendServer {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.project_id, self.id)
    }

    /// A server is usable when enabled and not inside a startup-disable window.
    pub fn is_available(&self, now: OffsetDateTime) -> bool {
        if !self.enabled {
            return false;
        }
        match self.disabled_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    pub fn is_auto_approved(&self, tool: &str) -> bool {
        self.auto_approve_tools.iter().any(|t| t == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_server(enabled: bool, disabled_until: Option<OffsetDateTime>) -> BackendServer {
        BackendServer {
            id: ServerId::new(),
            project_id: ProjectId::new(),
            name: "fs".to_string(),
            display_name: None,
            description: None,
            transport: TransportConfig::Stdio {
                command: "echo-mcp".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            enabled,
            disabled_until,
            timeout: Duration::from_secs(30),
            auto_approve_tools: vec!["read_file".to_string()],
            jwt_required: JwtRequirement::Inherit,
        }
    }

    #[test]
    fn test_session_key_equality() {
        let project = ProjectId::new();
        let server = ServerId::new();
        assert_eq!(
            SessionKey::new(project, server),
            SessionKey::new(project, server)
        );
        assert_ne!(
            SessionKey::new(project, server),
            SessionKey::new(ProjectId::new(), server)
        );
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!(
            "stdio".parse::<TransportKind>().unwrap(),
            TransportKind::Stdio
        );
        assert_eq!("SSE".parse::<TransportKind>().unwrap(), TransportKind::Sse);
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_jwt_requirement_resolution() {
        assert!(JwtRequirement::Required.resolve(Some(false)));
        assert!(!JwtRequirement::Disabled.resolve(Some(true)));
        assert!(JwtRequirement::Inherit.resolve(Some(true)));
        assert!(!JwtRequirement::Inherit.resolve(Some(false)));
        // No project default: fail closed
        assert!(JwtRequirement::Inherit.resolve(None));
    }

    #[test]
    fn test_server_availability() {
        let now = OffsetDateTime::now_utc();

        assert!(stdio_server(true, None).is_available(now));
        assert!(!stdio_server(false, None).is_available(now));

        // Disable window still in the future
        let later = now + time::Duration::minutes(5);
        assert!(!stdio_server(true, Some(later)).is_available(now));

        // Window elapsed
        let earlier = now - time::Duration::minutes(5);
        assert!(stdio_server(true, Some(earlier)).is_available(now));
    }

    #[test]
    fn test_auto_approve_lookup() {
        let server = stdio_server(true, None);
        assert!(server.is_auto_approved("read_file"));
        assert!(!server.is_auto_approved("write_file"));
    }
}
