//! Capability loading: turn a provider's `tools/list` into descriptors.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::connection::{Connection, Session};
use super::errors::McpError;
use super::tool::{ToolDescriptor, ToolTarget};
use super::transport::extract_result;
use super::types::{CallToolResult, ListToolsResult, McpToolDefinition};

/// Upper bound on `nextCursor` pages from one provider.
const MAX_LIST_PAGES: usize = 64;

/// Load every tool exposed by an open connection.
///
/// Fails closed: one bad page or entry rejects the whole provider.
pub async fn load(connection: &Connection) -> Result<Vec<ToolDescriptor>, McpError> {
    let session = connection.session().ok_or_else(|| McpError::NotConnected {
        reason: format!("provider '{}' is not open", connection.name()),
    })?;

    let definitions = list_tools(session).await?;

    let provider = connection.name();
    let descriptors: Vec<ToolDescriptor> = definitions
        .into_iter()
        .map(|def| {
            let target = RemoteTarget {
                session: Arc::downgrade(session),
                remote_name: def.name.clone(),
            };
            ToolDescriptor::new(
                def.name,
                provider,
                def.description,
                def.input_schema,
                Arc::new(target),
            )
        })
        .collect();

    tracing::debug!(provider = %provider, tools = descriptors.len(), "capabilities loaded");
    Ok(descriptors)
}

async fn list_tools(session: &Session) -> Result<Vec<McpToolDefinition>, McpError> {
    let load_failed = |reason: String| McpError::CapabilityLoad {
        provider: session.provider().to_string(),
        reason,
    };

    let mut definitions = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let response = session
            .request("tools/list", params)
            .await
            .map_err(|e| load_failed(e.to_string()))?;
        let result = extract_result(response).map_err(|e| load_failed(e.to_string()))?;
        let page: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| load_failed(format!("malformed tool listing: {e}")))?;

        for def in &page.tools {
            validate_definition(def).map_err(&load_failed)?;
        }
        definitions.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(definitions),
        }
    }

    Err(load_failed(format!(
        "tool listing exceeded {MAX_LIST_PAGES} pages"
    )))
}

fn validate_definition(def: &McpToolDefinition) -> Result<(), String> {
    if def.name.trim().is_empty() {
        return Err("tool entry with empty name".into());
    }
    if !def.input_schema.is_object() {
        return Err(format!("tool '{}' has a non-object input schema", def.name));
    }
    Ok(())
}

// ─── Remote Invocation ───────────────────────────────────────────────────────

/// Dispatches `tools/call` to the session a tool was loaded from.
struct RemoteTarget {
    session: Weak<Session>,
    remote_name: String,
}

impl RemoteTarget {
    fn invocation_error(&self, reason: impl Into<String>) -> McpError {
        McpError::Invocation {
            tool: self.remote_name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ToolTarget for RemoteTarget {
    async fn call(&self, arguments: serde_json::Value) -> Result<serde_json::Value, McpError> {
        let session = self
            .session
            .upgrade()
            .filter(|s| s.is_open())
            .ok_or_else(|| McpError::NotConnected {
                reason: format!("provider for tool '{}' is closed", self.remote_name),
            })?;

        let params = serde_json::json!({
            "name": self.remote_name,
            "arguments": arguments,
        });

        let response = match session.request("tools/call", Some(params)).await {
            Ok(response) => response,
            Err(e @ McpError::NotConnected { .. }) => return Err(e),
            Err(e) => return Err(self.invocation_error(e.to_string())),
        };

        let result = extract_result(response).map_err(|e| self.invocation_error(e.to_string()))?;
        let call: CallToolResult = serde_json::from_value(result)
            .map_err(|e| self.invocation_error(format!("malformed call result: {e}")))?;

        if call.is_error {
            return Err(self.invocation_error(call.text()));
        }
        Ok(call_output(call))
    }
}

/// Structured content when present, else the text (as JSON if it parses).
fn call_output(call: CallToolResult) -> serde_json::Value {
    if let Some(structured) = call.structured_content {
        return structured;
    }
    let text = call.text();
    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::connection::Timeouts;
    use crate::mcp_client::transport::Transport;
    use crate::mcp_client::types::{JsonRpcResponse, ProviderSpec};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Handler = Box<dyn Fn(&str, Option<Value>) -> JsonRpcResponse + Send + Sync>;

    /// In-memory provider answering from a function.
    struct ScriptedTransport {
        handler: Handler,
        requests: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
        ) -> Result<JsonRpcResponse, McpError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok((self.handler)(method, params))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), McpError> {
            Ok(())
        }

        async fn close(&self, _grace: Duration) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn scripted<F>(handler: F) -> (Connection, Arc<AtomicUsize>)
    where
        F: Fn(&str, Option<Value>) -> JsonRpcResponse + Send + Sync + 'static,
    {
        let requests = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            handler: Box::new(handler),
            requests: Arc::clone(&requests),
        };
        let conn = Connection::with_transport(
            ProviderSpec::sse("math", "http://127.0.0.1:1/sse"),
            Box::new(transport),
            Timeouts::default(),
        );
        (conn, requests)
    }

    fn add_tool() -> Value {
        json!({
            "name": "add",
            "description": "Add two integers",
            "inputSchema": {"type": "object", "properties": {"a": {}, "b": {}}}
        })
    }

    #[tokio::test]
    async fn test_load_builds_descriptors() {
        let (conn, _) = scripted(|method, _| match method {
            "tools/list" => JsonRpcResponse::success(json!(1), json!({ "tools": [add_tool()] })),
            _ => JsonRpcResponse::failure(json!(1), -32601, "nope"),
        });

        let tools = load(&conn).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "add");
        assert_eq!(tools[0].provider(), "math");
        assert_eq!(tools[0].description(), "Add two integers");
    }

    #[tokio::test]
    async fn test_load_follows_cursor() {
        let (conn, requests) = scripted(|_, params| {
            let cursor = params.and_then(|p| p["cursor"].as_str().map(String::from));
            match cursor.as_deref() {
                None => JsonRpcResponse::success(
                    json!(1),
                    json!({ "tools": [add_tool()], "nextCursor": "page2" }),
                ),
                Some(_) => JsonRpcResponse::success(
                    json!(2),
                    json!({ "tools": [{
                        "name": "subtract",
                        "inputSchema": {"type": "object"}
                    }]}),
                ),
            }
        });

        let tools = load(&conn).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["add", "subtract"]);
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_fails_whole_provider() {
        let (conn, _) = scripted(|_, _| {
            JsonRpcResponse::success(
                json!(1),
                json!({ "tools": [add_tool(), {"name": "broken"}] }),
            )
        });

        let err = load(&conn).await.unwrap_err();
        assert!(matches!(err, McpError::CapabilityLoad { ref provider, .. } if provider == "math"));
    }

    #[tokio::test]
    async fn test_list_error_is_capability_load() {
        let (conn, _) =
            scripted(|_, _| JsonRpcResponse::failure(json!(1), -32601, "Method not found"));

        let err = load(&conn).await.unwrap_err();
        assert!(err.to_string().contains("Method not found"), "{err}");
    }

    #[tokio::test]
    async fn test_load_requires_open_connection() {
        let mut conn = Connection::new(
            Arc::new(ProviderSpec::sse("math", "http://127.0.0.1:1/sse")),
            Timeouts::default(),
        );
        assert!(matches!(load(&conn).await, Err(McpError::NotConnected { .. })));
        conn.close().await.unwrap();
        assert!(matches!(load(&conn).await, Err(McpError::NotConnected { .. })));
    }

    fn calculator(method: &str, params: Option<Value>) -> JsonRpcResponse {
        match method {
            "tools/list" => JsonRpcResponse::success(json!(1), json!({ "tools": [add_tool()] })),
            "tools/call" => {
                let args = params.map(|p| p["arguments"].clone()).unwrap_or_default();
                match (args["a"].as_i64(), args["b"].as_i64()) {
                    (Some(a), Some(b)) => JsonRpcResponse::success(
                        json!(2),
                        json!({ "content": [{"type": "text", "text": (a + b).to_string()}] }),
                    ),
                    _ => JsonRpcResponse::success(
                        json!(2),
                        json!({
                            "content": [{"type": "text", "text": "a and b are required"}],
                            "isError": true
                        }),
                    ),
                }
            }
            _ => JsonRpcResponse::failure(json!(1), -32601, "nope"),
        }
    }

    #[tokio::test]
    async fn test_invoke_parses_text_result() {
        let (conn, _) = scripted(calculator);
        let tools = load(&conn).await.unwrap();

        let out = tools[0].invoke(json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_is_error_result_maps_to_invocation() {
        let (conn, _) = scripted(calculator);
        let tools = load(&conn).await.unwrap();

        let err = tools[0].invoke(json!({})).await.unwrap_err();
        match err {
            McpError::Invocation { tool, reason } => {
                assert_eq!(tool, "add");
                assert_eq!(reason, "a and b are required");
            }
            other => panic!("expected Invocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_after_close_is_not_connected() {
        let (mut conn, requests) = scripted(calculator);
        let tools = load(&conn).await.unwrap();
        conn.close().await.unwrap();
        let before = requests.load(Ordering::SeqCst);

        let err = tools[0].invoke(json!({"a": 1, "b": 1})).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
        assert_eq!(requests.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_invoke_after_drop_is_not_connected() {
        let (conn, _) = scripted(calculator);
        let tools = load(&conn).await.unwrap();
        drop(conn);

        let err = tools[0].invoke(json!({"a": 1, "b": 1})).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
    }

    #[test]
    fn test_call_output_prefers_structured_content() {
        let call: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"result": 5}
        }))
        .unwrap();
        assert_eq!(call_output(call), json!({"result": 5}));

        let call: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "Sunny, 75°F"}]
        }))
        .unwrap();
        assert_eq!(call_output(call), json!("Sunny, 75°F"));
    }
}
