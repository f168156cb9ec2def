//! Request routing by backend namespace
//!
//! On a unified channel every enabled backend of a project sits behind one
//! stream, so names must carry their origin. Tools and prompts are namespaced
//! as `{server_name}.{name}`; resources as `mcp+{server_name}://{original_uri}`.
//! A request may also pin its backend explicitly with a `params._server`
//! field, which wins over name parsing.

use serde_json::Value;

use super::types::{Prompt, Resource, Tool};

/// Separator between server name and tool/prompt name
pub const NAMESPACE_SEPARATOR: char = '.';

/// Parameter field that pins a request to a backend by name
pub const SERVER_PARAM: &str = "_server";

/// Parsed name with its server prefix
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    pub server: String,
    pub name: String,
}

/// Create a namespaced tool or prompt name
pub fn prefix_name(server: &str, name: &str) -> String {
    format!("{}{}{}", server, NAMESPACE_SEPARATOR, name)
}

/// Parse a namespaced name back into server and original name
pub fn parse_name(prefixed: &str) -> Option<ParsedName> {
    let (server, name) = prefixed.split_once(NAMESPACE_SEPARATOR)?;
    if server.is_empty() || name.is_empty() {
        return None;
    }
    Some(ParsedName {
        server: server.to_string(),
        name: name.to_string(),
    })
}

/// Create a namespaced resource URI
pub fn prefix_resource_uri(server: &str, original_uri: &str) -> String {
    format!("mcp+{}://{}", server, original_uri)
}

/// Parse a namespaced resource URI
pub fn parse_resource_uri(prefixed: &str) -> Option<ParsedName> {
    let rest = prefixed.strip_prefix("mcp+")?;
    let (server, uri) = rest.split_once("://")?;
    if server.is_empty() || uri.is_empty() {
        return None;
    }
    Some(ParsedName {
        server: server.to_string(),
        name: uri.to_string(),
    })
}

/// Extract an explicit `_server` pin from request params, if present
pub fn server_param(params: Option<&Value>) -> Option<String> {
    params?
        .get(SERVER_PARAM)
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Strip the `_server` pin before forwarding params to a backend
pub fn strip_server_param(params: Option<Value>) -> Option<Value> {
    let mut params = params?;
    if let Some(obj) = params.as_object_mut() {
        obj.remove(SERVER_PARAM);
        if obj.is_empty() {
            return Some(Value::Object(Default::default()));
        }
    }
    Some(params)
}

/// Prefix all tools with the server name. Duplicate tool names across
/// backends stay distinct instead of being deduped.
pub fn prefix_tools(server: &str, tools: Vec<Tool>) -> Vec<Tool> {
    tools
        .into_iter()
        .map(|mut tool| {
            tool.name = prefix_name(server, &tool.name);
            tool.description = Some(match tool.description {
                Some(desc) => format!("[{}] {}", server, desc),
                None => format!("[{}]", server),
            });
            tool
        })
        .collect()
}

/// Prefix all resources with the server name
pub fn prefix_resources(server: &str, resources: Vec<Resource>) -> Vec<Resource> {
    resources
        .into_iter()
        .map(|mut resource| {
            resource.uri = prefix_resource_uri(server, &resource.uri);
            resource.description = Some(match resource.description {
                Some(desc) => format!("[{}] {}", server, desc),
                None => format!("[{}]", server),
            });
            resource
        })
        .collect()
}

/// Prefix all prompts with the server name
pub fn prefix_prompts(server: &str, prompts: Vec<Prompt>) -> Vec<Prompt> {
    prompts
        .into_iter()
        .map(|mut prompt| {
            prompt.name = prefix_name(server, &prompt.name);
            prompt.description = Some(match prompt.description {
                Some(desc) => format!("[{}] {}", server, desc),
                None => format!("[{}]", server),
            });
            prompt
        })
        .collect()
}

/// How the bridge treats an inbound method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Answered by the bridge itself, never forwarded
    BridgeHandled,
    /// Fanned out to every enabled backend and merged
    Aggregated,
    /// Routed to exactly one backend
    Routed,
    /// Client-side notification, acknowledged without forwarding
    Notification,
    Unknown,
}

pub fn classify_method(method: &str) -> MethodKind {
    match method {
        "initialize" | "ping" => MethodKind::BridgeHandled,
        "notifications/initialized" | "notifications/cancelled" | "notifications/roots/list_changed" => {
            MethodKind::Notification
        }
        "tools/list" | "resources/list" | "prompts/list" => MethodKind::Aggregated,
        "tools/call" | "resources/read" | "prompts/get" | "resources/subscribe"
        | "resources/unsubscribe" | "completion/complete" | "logging/setLevel" => MethodKind::Routed,
        _ => MethodKind::Unknown,
    }
}
