//! Wire types shared by the client transports and the self-hosted providers,
//! plus the resolved `ProviderSpec`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// MCP protocol revision spoken by both client and self-hosted providers.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request or notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

const JSONRPC_VERSION: &str = "2.0";

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self::build(Some(id.into()), method, params)
    }

    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self::build(None, method, params)
    }

    fn build(
        id: Option<serde_json::Value>,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Notifications carry no id.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Exactly one of `result` and `error` is set by a well-behaved peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// A success response echoing `id`.
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// An error response echoing `id`.
    pub fn failure(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The numeric id, when the peer used one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Payloads ────────────────────────────────────────────────────────────

/// One entry of a `tools/list` page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "params_schema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A single content block of a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(other)]
    Unsupported,
}

/// `tools/call` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(
        default,
        rename = "structuredContent",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<serde_json::Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `initialize` result; every field is optional in practice.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Provider Specs ──────────────────────────────────────────────────────────

/// How a provider is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Long-lived HTTP event stream at a URL.
    Sse,
    /// Child process speaking line-delimited JSON-RPC over stdin/stdout.
    Stdio,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Sse => f.write_str("sse"),
            TransportKind::Stdio => f.write_str("stdio"),
        }
    }
}

/// Fully resolved provider description. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub name: String,
    pub transport: TransportKind,
    /// URL for `Sse`, executable for `Stdio`.
    pub target: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ProviderSpec {
    /// An SSE provider at `url`.
    pub fn sse(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Sse,
            target: url.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// A subprocess provider launched as `command args…`.
    pub fn stdio(name: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            target: command.to_string(),
            args,
            env: HashMap::new(),
        }
    }

    /// Add an environment overlay entry.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

// ─── Error Codes ─────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 reserved error codes used by the providers.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Also used for calls naming an unknown tool.
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = JsonRpcRequest::new(9, "tools/list", None);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"})
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(note.is_notification());
    }

    #[test]
    fn test_error_response_parses() {
        let json = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such method"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.numeric_id(), Some(2));
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tool_definition_requires_schema() {
        let json = r#"{"name": "add", "description": "Add two numbers"}"#;
        assert!(serde_json::from_str::<McpToolDefinition>(json).is_err());

        let json = r#"{"name": "add", "inputSchema": {"type": "object"}}"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.description, "");
    }

    #[test]
    fn test_call_tool_result_text_joins_blocks() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "first"},
                {"type": "resource", "resource": {}},
                {"type": "text", "text": "second"}
            ]
        }"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "first\nsecond");
    }

    #[test]
    fn test_provider_spec_builders() {
        let spec = ProviderSpec::stdio("sourcecontrol", "docker", vec!["run".into()])
            .with_env("GITHUB_PERSONAL_ACCESS_TOKEN", "t0k");
        assert_eq!(spec.transport, TransportKind::Stdio);
        assert_eq!(spec.env.get("GITHUB_PERSONAL_ACCESS_TOKEN").map(String::as_str), Some("t0k"));
        assert_eq!(TransportKind::Sse.to_string(), "sse");
    }
}
