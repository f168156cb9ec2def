//! Server registry: read model over persisted backend definitions
//!
//! A pure read adapter over the `mcp_servers` table, scoped by project.
//! Encrypted columns are decrypted on the way out and ciphertext never leaves
//! this module. There is no caching here: every call is one database round
//! trip, which is why the session manager only consults the registry on a
//! cache miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use gateway_shared::{
    BackendServer, BackendServerRow, CryptoEnvelope, ProjectId, ServerId, TransportConfig,
    TransportKind,
};

use crate::error::{ApiError, ApiResult};

const SELECT_COLUMNS: &str = r#"
    SELECT id, project_id, name, display_name, description, transport, enabled,
           disabled_until, timeout_ms, auto_approve_tools, jwt_required,
           command, args_encrypted, env_encrypted, cwd,
           url, headers_encrypted, created_at, updated_at
    FROM mcp_servers
"#;

/// Read-only view of backend server definitions
pub struct ServerRegistry {
    pool: PgPool,
    crypto: Arc<CryptoEnvelope>,
}

impl ServerRegistry {
    pub fn new(pool: PgPool, crypto: Arc<CryptoEnvelope>) -> Self {
        Self { pool, crypto }
    }

    /// Look up one server by opaque id or human name within a project.
    pub async fn get(&self, project_id: ProjectId, server_ref: &str) -> ApiResult<BackendServer> {
        let row: Option<BackendServerRow> = match uuid::Uuid::parse_str(server_ref) {
            Ok(id) => {
                sqlx::query_as(&format!("{} WHERE project_id = $1 AND id = $2", SELECT_COLUMNS))
                    .bind(project_id.0)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            Err(_) => {
                sqlx::query_as(&format!(
                    "{} WHERE project_id = $1 AND name = $2",
                    SELECT_COLUMNS
                ))
                .bind(project_id.0)
                .bind(server_ref)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        let row = row.ok_or_else(|| ApiError::ServerNotFound(server_ref.to_string()))?;
        self.decrypt_row(row)
    }

    /// Every enabled server in a project, for unified fan-out.
    pub async fn list_enabled(&self, project_id: ProjectId) -> ApiResult<Vec<BackendServer>> {
        let rows: Vec<BackendServerRow> = sqlx::query_as(&format!(
            "{} WHERE project_id = $1 AND enabled ORDER BY name",
            SELECT_COLUMNS
        ))
        .bind(project_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut servers = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.name.clone();
            match self.decrypt_row(row) {
                Ok(server) => servers.push(server),
                Err(e) => {
                    // One undecryptable server must not take down the whole
                    // project listing; it is simply unavailable.
                    tracing::error!(project_id = %project_id, server = %name, error = %e,
                        "Skipping server with undecryptable configuration");
                }
            }
        }
        Ok(servers)
    }

    fn decrypt_row(&self, row: BackendServerRow) -> ApiResult<BackendServer> {
        let kind: TransportKind = row
            .transport
            .parse()
            .map_err(|e: String| ApiError::BadRequest(e))?;

        let transport = match kind {
            TransportKind::Stdio => {
                let command = row.command.ok_or_else(|| {
                    ApiError::BadRequest(format!("stdio server {} has no command", row.name))
                })?;
                let args: Vec<String> = match &row.args_encrypted {
                    Some(token) => self.decrypt_field(&row.name, token)?,
                    None => Vec::new(),
                };
                let env: HashMap<String, String> = match &row.env_encrypted {
                    Some(token) => self.decrypt_field(&row.name, token)?,
                    None => HashMap::new(),
                };
                TransportConfig::Stdio {
                    command,
                    args,
                    env,
                    cwd: row.cwd,
                }
            }
            TransportKind::Sse => {
                let url = row.url.ok_or_else(|| {
                    ApiError::BadRequest(format!("sse server {} has no url", row.name))
                })?;
                let headers: HashMap<String, String> = match &row.headers_encrypted {
                    Some(token) => self.decrypt_field(&row.name, token)?,
                    None => HashMap::new(),
                };
                TransportConfig::Sse { url, headers }
            }
        };

        Ok(BackendServer {
            id: ServerId(row.id),
            project_id: ProjectId(row.project_id),
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            transport,
            enabled: row.enabled,
            disabled_until: row.disabled_until,
            timeout: Duration::from_millis(row.timeout_ms.max(0) as u64),
            auto_approve_tools: row.auto_approve_tools,
            jwt_required: row.jwt_required.parse().unwrap_or_default(),
        })
    }

    fn decrypt_field<T: serde::de::DeserializeOwned>(
        &self,
        server_name: &str,
        token: &str,
    ) -> ApiResult<T> {
        self.crypto.decrypt_json(token).map_err(|e| {
            // Log the failure but never the token or key material
            tracing::error!(server = %server_name, error = %e, "Failed to decrypt server field");
            ApiError::Decrypt
        })
    }
}
