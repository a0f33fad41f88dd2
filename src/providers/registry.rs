//! Explicit tool registration table and JSON-RPC dispatch for self-hosted
//! providers.
//!
//! A provider is a `ProviderRegistry` built once at startup; the serving
//! transports (`server`, `stdio`) feed raw messages to `handle_message` and
//! write back whatever it returns.

use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp_client::types::{
    error_codes, JsonRpcRequest, JsonRpcResponse, McpToolDefinition, PROTOCOL_VERSION,
};

/// Why a tool handler refused or failed a call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("missing or invalid argument '{name}': expected {expected}")]
    InvalidArgument { name: String, expected: &'static str },

    #[error("{0}")]
    Failed(String),
}

type Handler = Box<dyn Fn(&Value) -> Result<Value, ToolFailure> + Send + Sync>;

struct RegisteredTool {
    definition: McpToolDefinition,
    handler: Handler,
}

/// Tools a self-hosted provider exposes, in registration order.
pub struct ProviderRegistry {
    name: String,
    tools: Vec<RegisteredTool>,
}

impl ProviderRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
        }
    }

    /// Register a tool. Later registrations under the same name replace
    /// earlier ones.
    pub fn tool<F>(mut self, name: &str, description: &str, input_schema: Value, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, ToolFailure> + Send + Sync + 'static,
    {
        let registered = RegisteredTool {
            definition: McpToolDefinition {
                name: name.to_string(),
                description: description.to_string(),
                input_schema,
            },
            handler: Box::new(handler),
        };
        match self.tools.iter_mut().find(|t| t.definition.name == name) {
            Some(slot) => *slot = registered,
            None => self.tools.push(registered),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &McpToolDefinition> {
        self.tools.iter().map(|t| &t.definition)
    }

    /// Run a tool directly.
    pub fn call(&self, name: &str, arguments: &Value) -> Option<Result<Value, ToolFailure>> {
        let tool = self.tools.iter().find(|t| t.definition.name == name)?;
        Some((tool.handler)(arguments))
    }
}

// ─── Argument Helpers ────────────────────────────────────────────────────────

pub fn required_i64(args: &Value, name: &str) -> Result<i64, ToolFailure> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(name, "integer"))
}

pub fn optional_i64(args: &Value, name: &str, default: i64) -> Result<i64, ToolFailure> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_i64().ok_or_else(|| invalid(name, "integer")),
    }
}

pub fn required_f64(args: &Value, name: &str) -> Result<f64, ToolFailure> {
    args.get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| invalid(name, "number"))
}

pub fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolFailure> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(name, "string"))
}

fn invalid(name: &str, expected: &'static str) -> ToolFailure {
    ToolFailure::InvalidArgument {
        name: name.to_string(),
        expected,
    }
}

/// JSON schema for an object with the given `(name, type)` properties.
pub fn object_schema(properties: &[(&str, &str)], required: &[&str]) -> Value {
    let props: serde_json::Map<String, Value> = properties
        .iter()
        .map(|(name, ty)| (name.to_string(), json!({ "type": ty })))
        .collect();
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// Handle one raw JSON-RPC message.
///
/// Returns the serialized response, or `None` for notifications.
pub fn handle_message(registry: &ProviderRegistry, raw: &str) -> Option<String> {
    let response = match serde_json::from_str::<Value>(raw) {
        Err(e) => Some(JsonRpcResponse::failure(
            Value::Null,
            error_codes::PARSE_ERROR,
            format!("Parse error: {e}"),
        )),
        Ok(value) => match serde_json::from_value::<JsonRpcRequest>(value) {
            Err(e) => Some(JsonRpcResponse::failure(
                Value::Null,
                error_codes::INVALID_REQUEST,
                format!("Invalid request: {e}"),
            )),
            Ok(request) => dispatch(registry, request),
        },
    }?;

    match serde_json::to_string(&response) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(provider = %registry.name, error = %e, "failed to serialize response");
            None
        }
    }
}

fn dispatch(registry: &ProviderRegistry, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    let Some(id) = request.id else {
        tracing::trace!(provider = %registry.name, method = %request.method, "notification");
        return None;
    };

    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": registry.name,
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            let tools: Vec<&McpToolDefinition> = registry.definitions().collect();
            JsonRpcResponse::success(id, json!({ "tools": tools }))
        }
        "tools/call" => call_tool(registry, id, request.params.unwrap_or(Value::Null)),
        other => JsonRpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    };
    Some(response)
}

fn call_tool(registry: &ProviderRegistry, id: Value, params: Value) -> JsonRpcResponse {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, "missing tool name");
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let Some(outcome) = registry.call(name, &arguments) else {
        return JsonRpcResponse::failure(
            id,
            error_codes::INVALID_PARAMS,
            format!("Unknown tool: {name}"),
        );
    };

    match outcome {
        Ok(value) => {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            tracing::info!(provider = %registry.name, tool = %name, result = %text, "tool call");
            JsonRpcResponse::success(
                id,
                json!({ "content": [{ "type": "text", "text": text }], "isError": false }),
            )
        }
        Err(failure) => {
            tracing::error!(provider = %registry.name, tool = %name, error = %failure, "tool call failed");
            JsonRpcResponse::success(
                id,
                json!({
                    "content": [{ "type": "text", "text": failure.to_string() }],
                    "isError": true
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> ProviderRegistry {
        ProviderRegistry::new("Echo")
            .tool(
                "echo",
                "Echo text",
                object_schema(&[("text", "string")], &["text"]),
                |args| Ok(Value::String(required_str(args, "text")?.to_string())),
            )
            .tool("fail", "Always fails", object_schema(&[], &[]), |_| {
                Err(ToolFailure::Failed("nope".into()))
            })
    }

    fn roundtrip(registry: &ProviderRegistry, raw: &str) -> Value {
        let out = handle_message(registry, raw).expect("response expected");
        serde_json::from_str(&out).unwrap()
    }

    #[test]
    fn test_initialize_reports_protocol_and_name() {
        let resp = roundtrip(
            &echo_registry(),
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        );
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "Echo");
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn test_tools_list_in_registration_order() {
        let resp = roundtrip(&echo_registry(), r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#);
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "echo");
        assert_eq!(tools[0]["inputSchema"]["required"][0], "text");
        assert_eq!(tools[1]["name"], "fail");
    }

    #[test]
    fn test_tools_call_success_and_failure() {
        let registry = echo_registry();
        let ok = roundtrip(
            &registry,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}}}"#,
        );
        assert_eq!(ok["result"]["content"][0]["text"], "hi");
        assert_eq!(ok["result"]["isError"], false);

        let failed = roundtrip(
            &registry,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"fail"}}"#,
        );
        assert_eq!(failed["result"]["isError"], true);
        assert_eq!(failed["result"]["content"][0]["text"], "nope");

        let bad_args = roundtrip(
            &registry,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"echo","arguments":{}}}"#,
        );
        assert_eq!(bad_args["result"]["isError"], true);
        assert!(bad_args["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("'text'"));
    }

    #[test]
    fn test_unknown_tool_and_method() {
        let registry = echo_registry();
        let resp = roundtrip(
            &registry,
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"missing"}}"#,
        );
        assert_eq!(resp["error"]["code"], error_codes::INVALID_PARAMS);

        let resp = roundtrip(&registry, r#"{"jsonrpc":"2.0","id":7,"method":"resources/list"}"#);
        assert_eq!(resp["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_parse_errors_and_notifications() {
        let registry = echo_registry();
        let resp = roundtrip(&registry, "{not json");
        assert_eq!(resp["error"]["code"], error_codes::PARSE_ERROR);
        assert!(resp["id"].is_null());

        let resp = roundtrip(&registry, r#"{"jsonrpc":"2.0","id":8}"#);
        assert_eq!(resp["error"]["code"], error_codes::INVALID_REQUEST);

        assert!(handle_message(
            &registry,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        )
        .is_none());
    }

    #[test]
    fn test_argument_helpers() {
        let args = json!({"a": 4, "b": 2.5, "s": "x", "n": null});
        assert_eq!(required_i64(&args, "a"), Ok(4));
        assert!(required_i64(&args, "b").is_err());
        assert_eq!(required_f64(&args, "a"), Ok(4.0));
        assert_eq!(required_str(&args, "s"), Ok("x"));
        assert_eq!(optional_i64(&args, "n", 3), Ok(3));
        assert_eq!(optional_i64(&args, "missing", 3), Ok(3));
        assert!(optional_i64(&args, "s", 3).is_err());
    }

    #[test]
    fn test_reregistering_replaces_tool() {
        let registry = echo_registry().tool("echo", "Louder", object_schema(&[], &[]), |_| {
            Ok(json!("HI"))
        });
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.call("echo", &json!({})), Some(Ok(json!("HI"))));
    }
}
