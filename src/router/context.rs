//! Method classification and per-request context.
//!
//! Every MCP method maps to a handler strategy (passthrough, full policy
//! enforcement, or list filtering) and an audit log level. Unknown methods
//! default to passthrough with metadata logging so new protocol methods
//! degrade safely instead of being rejected.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

use rand::RngCore;
use serde_json::{Map, Value};

use super::jsonrpc::JsonRpcRequest;

/// How the router treats a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Forward without a policy check (`ping`, `initialize`, ...).
    Passthrough,
    /// Full policy enforcement before forwarding (`tools/call`, ...).
    Enforce,
    /// Forward, then filter list results (`tools/list`, ...).
    Filter,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Passthrough => "passthrough",
            HandlerKind::Enforce => "enforce",
            HandlerKind::Filter => "filter",
        }
    }
}

/// Audit detail level for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// No audit row.
    None,
    /// Identifiers and method only.
    Metadata,
    /// Full request detail including arguments.
    Full,
}

/// Static handling configuration for one method.
#[derive(Debug, Clone, Copy)]
pub struct MethodConfig {
    pub handler: HandlerKind,
    pub log_level: LogLevel,
    pub description: &'static str,
}

/// Registry of known MCP methods.
static METHOD_REGISTRY: LazyLock<HashMap<&'static str, MethodConfig>> = LazyLock::new(|| {
    HashMap::from([
        (
            "tools/call",
            MethodConfig {
                handler: HandlerKind::Enforce,
                log_level: LogLevel::Full,
                description: "Invoke a tool",
            },
        ),
        (
            "tools/list",
            MethodConfig {
                handler: HandlerKind::Filter,
                log_level: LogLevel::Metadata,
                description: "List available tools",
            },
        ),
        (
            "resources/read",
            MethodConfig {
                handler: HandlerKind::Enforce,
                log_level: LogLevel::Full,
                description: "Read a resource",
            },
        ),
        (
            "resources/list",
            MethodConfig {
                handler: HandlerKind::Filter,
                log_level: LogLevel::Metadata,
                description: "List available resources",
            },
        ),
        (
            "resources/subscribe",
            MethodConfig {
                handler: HandlerKind::Enforce,
                log_level: LogLevel::Full,
                description: "Subscribe to resource updates",
            },
        ),
        (
            "prompts/get",
            MethodConfig {
                handler: HandlerKind::Passthrough,
                log_level: LogLevel::Metadata,
                description: "Get a prompt template",
            },
        ),
        (
            "prompts/list",
            MethodConfig {
                handler: HandlerKind::Passthrough,
                log_level: LogLevel::Metadata,
                description: "List available prompts",
            },
        ),
        (
            "initialize",
            MethodConfig {
                handler: HandlerKind::Passthrough,
                log_level: LogLevel::Metadata,
                description: "Initialize MCP session",
            },
        ),
        (
            "ping",
            MethodConfig {
                handler: HandlerKind::Passthrough,
                log_level: LogLevel::None,
                description: "Health check ping",
            },
        ),
        (
            "notifications/initialized",
            MethodConfig {
                handler: HandlerKind::Passthrough,
                log_level: LogLevel::None,
                description: "Client initialization complete",
            },
        ),
        (
            "notifications/cancelled",
            MethodConfig {
                handler: HandlerKind::Passthrough,
                log_level: LogLevel::Metadata,
                description: "Request cancelled",
            },
        ),
    ])
});

const UNKNOWN_METHOD_CONFIG: MethodConfig = MethodConfig {
    handler: HandlerKind::Passthrough,
    log_level: LogLevel::Metadata,
    description: "Unknown method",
};

/// Looks up the handling configuration for a method name.
pub fn classify(method: &str) -> MethodConfig {
    METHOD_REGISTRY
        .get(method)
        .copied()
        .unwrap_or(UNKNOWN_METHOD_CONFIG)
}

/// Per-request state assembled once at route entry and dropped at route
/// exit. Holds everything the policy evaluator and audit sink need.
#[derive(Debug)]
pub struct RequestContext {
    /// Parsed envelope.
    pub request: JsonRpcRequest,
    /// Gateway-assigned identifier (`req_` + 8 hex chars).
    pub request_id: String,
    pub method: String,
    /// Tool name, for `tools/call`.
    pub tool: String,
    /// Resource URI, for `resources/read`.
    pub resource_uri: String,
    /// Tool arguments, for `tools/call`.
    pub arguments: Option<Map<String, Value>>,
    pub config: MethodConfig,
    pub received_at: Instant,
    /// Opaque credential from `params._meta.agentfacts`, if present.
    pub agentfacts_token: Option<String>,
}

impl RequestContext {
    /// Builds a context for a parsed request, reusing the timestamp taken
    /// at route entry.
    pub fn new(request: JsonRpcRequest, received_at: Instant) -> Self {
        let method = request.method.clone().unwrap_or_default();
        let config = classify(&method);
        Self {
            request,
            request_id: generate_request_id(),
            method,
            tool: String::new(),
            resource_uri: String::new(),
            arguments: None,
            config,
            received_at,
            agentfacts_token: None,
        }
    }
}

/// Creates a unique request identifier from the process-wide CSPRNG.
pub fn generate_request_id() -> String {
    let mut buf = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    format!("req_{}", hex::encode(buf))
}
