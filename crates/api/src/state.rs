//! Shared application state
//!
//! One explicit value threaded through every handler instead of module-level
//! singletons. Construction order matters and is fixed here:
//! encryption key → registry → session manager → (janitor) → bridge.
//! Tests build fresh instances; production builds exactly one.

use std::sync::Arc;

use sqlx::PgPool;

use gateway_shared::CryptoEnvelope;

use crate::bridge::ChannelRegistry;
use crate::config::Config;
use crate::error::ApiResult;
use crate::mcp::{AllowAllPolicy, Orchestrator, SessionManager, SessionManagerConfig};
use crate::registry::ServerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: PgPool,
    pub crypto: Arc<CryptoEnvelope>,
    pub registry: Arc<ServerRegistry>,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub channels: Arc<ChannelRegistry>,
}

impl AppState {
    pub fn assemble(config: Config, pool: PgPool) -> ApiResult<Self> {
        let crypto = Arc::new(
            CryptoEnvelope::from_base64_key(&config.encryption_key).map_err(|e| {
                tracing::error!(error = %e, "Failed to load encryption key");
                crate::error::ApiError::Internal
            })?,
        );
        let registry = Arc::new(ServerRegistry::new(pool.clone(), Arc::clone(&crypto)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            SessionManagerConfig {
                idle_timeout: config.session_idle_timeout,
                default_timeout: config.request_timeout,
                max_frame_bytes: config.max_frame_bytes,
            },
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            Arc::new(AllowAllPolicy),
        ));
        let channels = Arc::new(ChannelRegistry::new());

        Ok(Self {
            config,
            pool,
            crypto,
            registry,
            sessions,
            orchestrator,
            channels,
        })
    }
}
