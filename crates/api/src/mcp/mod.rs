//! MCP session and transport core
//!
//! This module owns every live connection to a backend MCP server:
//!
//! ```text
//! Client (IDE/chat) --> SSE Bridge --> Orchestrator --> Session Manager
//!                                                        |-- stdio child
//!                                                        `-- remote SSE
//! ```
//!
//! Sessions are cached per `(project, server)` key with idle eviction,
//! at-most-one concurrent construction per key, and crash recovery. The same
//! logical server name can exist in many projects without the sessions ever
//! touching.

pub mod namespace;
pub mod orchestrator;
pub mod session;
pub mod transport;
pub mod types;

pub use orchestrator::{AllowAllPolicy, ApprovalPolicy, Orchestrator, RequestContext};
pub use session::{EvictReason, Session, SessionHandle, SessionManager, SessionManagerConfig, SessionState};
pub use transport::{Transport, TransportError};
