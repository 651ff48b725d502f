//! MCP wire protocol types
//!
//! Based on the Model Context Protocol specification (JSON-RPC 2.0).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version this client speaks
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC request to an MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    /// Create a new MCP request
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        McpRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Create an initialize request
    pub fn initialize(id: u64) -> Self {
        Self::new(id, "initialize", Some(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "agentry",
                "version": env!("CARGO_PKG_VERSION")
            }
        })))
    }

    /// Create a tools/list request
    pub fn list_tools(id: u64, cursor: Option<&str>) -> Self {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        Self::new(id, "tools/list", params)
    }

    /// Create a tools/call request
    pub fn call_tool(id: u64, name: impl Into<String>, arguments: Value) -> Self {
        Self::new(id, "tools/call", Some(serde_json::json!({
            "name": name.into(),
            "arguments": arguments
        })))
    }
}

/// JSON-RPC notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpNotification {
    /// Create a new notification
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        McpNotification {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }

    /// Sent after a successful initialize exchange
    pub fn initialized() -> Self {
        Self::new("notifications/initialized", None)
    }

    /// Best-effort cancellation of an in-flight request
    pub fn cancelled(request_id: u64, reason: impl Into<String>) -> Self {
        Self::new("notifications/cancelled", Some(serde_json::json!({
            "requestId": request_id,
            "reason": reason.into()
        })))
    }
}

/// JSON-RPC response from an MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

/// MCP error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Result of a successful initialize exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Capabilities declared by the server, kept as-is
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<ServerInfo>,
}

/// Server identification from the initialize response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Tool definition from an MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(default)]
    pub description: String,
    /// Input schema (JSON Schema)
    #[serde(rename = "inputSchema")]
    pub input_schema: McpToolInput,
    /// Behavior hints declared by the server
    #[serde(default)]
    pub annotations: Option<ToolAnnotations>,
}

impl McpTool {
    /// Whether the server declares this tool free of side effects.
    ///
    /// Absent annotations mean the tool must be treated as side-effecting.
    pub fn is_read_only(&self) -> bool {
        self.annotations
            .as_ref()
            .map(|a| a.read_only_hint)
            .unwrap_or(false)
    }
}

/// Behavior hints attached to a tool descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "readOnlyHint", default)]
    pub read_only_hint: bool,
    #[serde(rename = "destructiveHint", default)]
    pub destructive_hint: bool,
}

/// Tool input schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInput {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub required: Vec<String>,
}

impl McpToolInput {
    /// Reassemble the full JSON Schema value for catalog export
    pub fn to_schema_value(&self) -> Value {
        serde_json::json!({
            "type": self.schema_type,
            "properties": self.properties,
            "required": self.required
        })
    }
}

/// Page of results from a tools/list response
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// Content block returned by a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

/// Result of a tools/call response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl McpToolResult {
    /// Join all text blocks into one string for the model
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_skips_empty_params() {
        let req = McpRequest::list_tools(7, None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_initialize_carries_protocol_version() {
        let req = McpRequest::initialize(1);
        let params = req.params.unwrap();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "agentry");
    }

    #[test]
    fn test_cancelled_notification_shape() {
        let note = McpNotification::cancelled(42, "deadline elapsed");
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["method"], "notifications/cancelled");
        assert_eq!(json["params"]["requestId"], 42);
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_tool_annotations_default_to_side_effecting() {
        let raw = serde_json::json!({
            "name": "delete_row",
            "description": "Deletes a row",
            "inputSchema": { "type": "object" }
        });
        let tool: McpTool = serde_json::from_value(raw).unwrap();
        assert!(!tool.is_read_only());

        let raw = serde_json::json!({
            "name": "get_row",
            "inputSchema": { "type": "object" },
            "annotations": { "readOnlyHint": true }
        });
        let tool: McpTool = serde_json::from_value(raw).unwrap();
        assert!(tool.is_read_only());
    }

    #[test]
    fn test_tool_result_text_joins_blocks() {
        let result = McpToolResult {
            content: vec![
                McpContent {
                    content_type: "text".to_string(),
                    text: Some("first".to_string()),
                    data: None,
                    mime_type: None,
                },
                McpContent {
                    content_type: "image".to_string(),
                    text: None,
                    data: Some("base64".to_string()),
                    mime_type: Some("image/png".to_string()),
                },
                McpContent {
                    content_type: "text".to_string(),
                    text: Some("second".to_string()),
                    data: None,
                    mime_type: None,
                },
            ],
            is_error: false,
        };
        assert_eq!(result.text(), "first\nsecond");
    }
}
