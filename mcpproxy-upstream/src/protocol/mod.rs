//! MCP protocol types: JSON-RPC 2.0 framing plus the client-side message set

pub mod jsonrpc;
pub mod messages;

pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse};
pub use messages::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, ServerCapabilities,
    ServerInfo, Tool, ToolContent, ToolsCallParams, ToolsCallResult, ToolsCapability,
    ToolsListParams, ToolsListResult,
};

use serde_json::Value;
use uuid::Uuid;

/// MCP protocol version requested during `initialize`
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Protocol versions this client accepts from servers
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Method names used by the client
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Generate a new request ID
pub fn generate_request_id() -> Value {
    Value::String(Uuid::new_v4().to_string())
}

/// Whether a server-reported protocol version is one we can speak
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
