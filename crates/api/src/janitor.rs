//! Janitor: periodic sweep of expired and dead sessions
//!
//! A single background task. Each tick snapshots the session table and asks
//! the manager to evict what is eligible; the table lock is never held
//! across a drain, and each drain is bounded so one stuck backend cannot
//! head-of-line block the sweep. On shutdown it runs a final drain of every
//! session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::mcp::SessionManager;

pub struct Janitor {
    sessions: Arc<SessionManager>,
    interval: Duration,
}

impl Janitor {
    pub fn new(sessions: Arc<SessionManager>, interval: Duration) -> Self {
        Self { sessions, interval }
    }

    /// Run until the shutdown signal flips, then drain everything.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep an empty table.
            ticker.tick().await;

            tracing::info!(interval = ?self.interval, "Janitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sessions.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Janitor stopping; draining all sessions");
            self.sessions.shutdown().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::SessionManagerConfig;
    use crate::registry::ServerRegistry;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use gateway_shared::{BackendServer, CryptoEnvelope, JwtRequirement, ProjectId, ServerId, TransportConfig};
    use std::collections::HashMap;

    fn test_manager(idle_timeout: Duration) -> Arc<SessionManager> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/gateway_test_unused")
            .expect("lazy pool");
        let crypto =
            Arc::new(CryptoEnvelope::from_base64_key(&BASE64.encode([3u8; 32])).unwrap());
        let registry = Arc::new(ServerRegistry::new(pool, crypto));
        Arc::new(SessionManager::new(
            registry,
            SessionManagerConfig {
                idle_timeout,
                default_timeout: Duration::from_secs(5),
                max_frame_bytes: 4 * 1024 * 1024,
            },
        ))
    }

    fn stub_server(project: ProjectId) -> BackendServer {
        let script = r#"
            read line
            printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub","version":"0"}}}'
            while read line; do :; done
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
            auto_approve_tools: vec![],
            jwt_required: JwtRequirement::Inherit,
        }
    }

    #[tokio::test]
    async fn test_janitor_evicts_idle_sessions() {
        let manager = test_manager(Duration::from_millis(50));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let _session = manager
            .get_or_create(stub_server(ProjectId::new()))
            .await
            .unwrap();
        assert_eq!(manager.session_count().await, 1);

        let handle = Janitor::new(Arc::clone(&manager), Duration::from_millis(30))
            .spawn(shutdown_rx);

        // Idle past the threshold, then give the janitor a few ticks
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if manager.session_count().await == 0 {
                break;
            }
        }
        assert_eq!(manager.session_count().await, 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_janitor_shutdown_drains_everything() {
        let manager = test_manager(Duration::from_secs(3600));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let _session = manager
            .get_or_create(stub_server(ProjectId::new()))
            .await
            .unwrap();
        assert_eq!(manager.session_count().await, 1);

        // Long interval: the only cleanup comes from the shutdown path
        let handle = Janitor::new(Arc::clone(&manager), Duration::from_secs(3600))
            .spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(manager.session_count().await, 0);
    }
}
