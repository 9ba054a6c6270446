//! MCP message types for the client side: initialize, tool discovery, tool calls

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// === Initialize Protocol ===

/// Parameters for the initialize method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol version
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Client capabilities
    pub capabilities: ClientCapabilities,

    /// Client information
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

impl InitializeParams {
    /// The parameters this proxy sends to every upstream
    pub fn for_proxy() -> Self {
        Self {
            protocol_version: super::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "mcpproxy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                metadata: HashMap::new(),
            },
        }
    }
}

/// Result of the initialize method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol version the server selected
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    /// Server capabilities
    pub capabilities: ServerCapabilities,

    /// Server information
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Client information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name
    pub name: String,

    /// Client version
    pub version: String,

    /// Additional client metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

/// Server information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name
    pub name: String,

    /// Server version
    pub version: String,

    /// Additional server metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

// === Capabilities ===

/// Client capabilities advertised during initialize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientCapabilities {
    /// Experimental capabilities
    #[serde(default)]
    pub experimental: HashMap<String, Value>,
}

/// Server capabilities returned from initialize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Experimental capabilities
    #[serde(default)]
    pub experimental: HashMap<String, Value>,

    /// Tools capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Tools capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolsCapability {
    /// Whether list_changed notifications are supported
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

// === Tool Protocol ===

/// Parameters for tools/list method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolsListParams {
    /// Optional cursor for pagination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Result of tools/list method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// List of available tools
    pub tools: Vec<Tool>,

    /// Next cursor for pagination
    #[serde(skip_serializing_if = "Option::is_none", rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Tool definition as reported by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name
    pub name: String,

    /// Tool description
    #[serde(default)]
    pub description: String,

    /// Input schema for the tool
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,

    /// Additional tool metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

/// Parameters for tools/call method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallParams {
    /// Tool name to call (the server's original name, never the prefixed one)
    pub name: String,

    /// Tool arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Result of tools/call method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsCallResult {
    /// Tool execution content
    pub content: Vec<ToolContent>,

    /// Whether the tool call is an error
    #[serde(default, rename = "isError")]
    pub is_error: bool,

    /// Additional metadata
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

impl ToolsCallResult {
    /// Concatenated text content, for error reporting
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content returned by tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },

    #[serde(rename = "resource")]
    Resource {
        resource: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_params_wire_format() {
        let params = InitializeParams::for_proxy();
        let value = serde_json::to_value(&params).unwrap();

        assert_eq!(value["protocolVersion"], super::super::MCP_PROTOCOL_VERSION);
        assert_eq!(value["clientInfo"]["name"], "mcpproxy");
    }

    #[test]
    fn test_initialize_result_parsing() {
        let raw = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": "demo", "version": "1.2.3" }
        });
        let result: InitializeResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.server_info.name, "demo");
        assert!(result.capabilities.tools.unwrap().list_changed);
    }

    #[test]
    fn test_tool_parsing_tolerates_missing_description() {
        let raw = json!({
            "name": "add",
            "inputSchema": {"type": "object", "properties": {"a": {"type": "integer"}}}
        });
        let tool: Tool = serde_json::from_value(raw).unwrap();
        assert_eq!(tool.name, "add");
        assert!(tool.description.is_empty());
    }

    #[test]
    fn test_call_result_text() {
        let result = ToolsCallResult {
            content: vec![
                ToolContent::Text {
                    text: "line one".to_string(),
                },
                ToolContent::Image {
                    data: "aGk=".to_string(),
                    mime_type: "image/png".to_string(),
                },
                ToolContent::Text {
                    text: "line two".to_string(),
                },
            ],
            is_error: false,
            metadata: HashMap::new(),
        };
        assert_eq!(result.text(), "line one\nline two");
    }
}
