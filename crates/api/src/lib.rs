//! MCP Gateway API
//!
//! Federates many Model Context Protocol servers behind one multi-tenant
//! HTTP endpoint. Clients speak JSON-RPC 2.0 over SSE; the gateway
//! multiplexes their requests onto locally spawned stdio servers or remote
//! SSE endpoints, with per-project namespacing and a session cache in
//! between.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod janitor;
pub mod mcp;
pub mod registry;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
