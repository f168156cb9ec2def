//! Bearer token verification for bridge endpoints
//!
//! The real identity model (users, teams, API keys) lives outside the
//! gateway; this module only checks that an inbound bearer token verifies
//! against `AUTH_SECRET`. With no secret configured the collaborator is
//! absent and every request counts as authenticated. With a secret, a
//! present-but-invalid token is rejected outright, while a missing token
//! produces an unauthenticated context that per-server `jwt_required`
//! settings decide on.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::mcp::RequestContext;

/// Claims the gateway cares about; anything else in the token is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Verify an HS256 bearer token against the shared secret
pub fn verify_bearer(secret: &str, token: &str) -> ApiResult<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::debug!(error = %e, "Bearer token rejected");
        ApiError::Unauthorized
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Build the request context for one inbound bridge request. An invalid
/// token is a hard 401; a missing one is only fatal for backends that
/// require verified callers.
pub fn context_from_headers(config: &Config, headers: &HeaderMap) -> ApiResult<RequestContext> {
    match (&config.auth_secret, bearer_token(headers)) {
        (None, _) => Ok(RequestContext {
            authenticated: true,
            caller: None,
        }),
        (Some(_), None) => Ok(RequestContext {
            authenticated: false,
            caller: None,
        }),
        (Some(secret), Some(token)) => {
            let claims = verify_bearer(secret, token)?;
            Ok(RequestContext {
                authenticated: true,
                caller: Some(claims.sub),
            })
        }
    }
}
