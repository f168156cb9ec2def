//! Application configuration

use std::env;
use std::time::Duration;

/// Stdio frame size cap (4 MiB). Messages above this kill the session.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Encryption key for server secrets (base64, 32 bytes decoded)
    pub encryption_key: String,

    // Authentication (consumed by the bearer-token collaborator)
    pub auth_secret: Option<String>,
    pub initial_admin_email: Option<String>,

    // Session manager
    pub session_idle_timeout: Duration,
    pub session_cleanup_interval: Duration,

    // MCP requests
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),

            encryption_key: {
                let key = env::var("MCP_ENCRYPTION_KEY")
                    .map_err(|_| ConfigError::Missing("MCP_ENCRYPTION_KEY"))?;
                validate_encryption_key(&key)?;
                key
            },

            auth_secret: env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty()),
            initial_admin_email: env::var("INITIAL_ADMIN_EMAIL").ok().filter(|s| !s.is_empty()),

            session_idle_timeout: Duration::from_secs(
                60 * env::var("MCP_SESSION_TIMEOUT_MINUTES")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),
            session_cleanup_interval: Duration::from_secs(
                60 * env::var("MCP_SESSION_CLEANUP_INTERVAL_MINUTES")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            ),

            request_timeout: Duration::from_millis(
                env::var("MCP_REQUEST_TIMEOUT_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30000),
            ),
            max_frame_bytes: env::var("MCP_MAX_FRAME_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_FRAME_BYTES),
        })
    }
}

/// Validate the at-rest encryption key: base64-encoded 32 bytes, not a known
/// insecure value. Generate with: openssl rand -base64 32
fn validate_encryption_key(key: &str) -> Result<(), ConfigError> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let decoded = BASE64.decode(key.trim()).map_err(|_| {
        ConfigError::InvalidEncryptionKey("MCP_ENCRYPTION_KEY must be valid base64")
    })?;

    if decoded.len() != 32 {
        return Err(ConfigError::InvalidEncryptionKey(
            "MCP_ENCRYPTION_KEY must decode to exactly 32 bytes",
        ));
    }

    if decoded.iter().all(|&b| b == 0) || decoded.iter().all(|&b| b == 0xff) {
        return Err(ConfigError::InsecureEncryptionKey(
            "MCP_ENCRYPTION_KEY is a known insecure value",
        ));
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid encryption key: {0}")]
    InvalidEncryptionKey(&'static str),
    #[error("Insecure encryption key: {0}")]
    InsecureEncryptionKey(&'static str),
}
