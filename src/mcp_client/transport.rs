//! Transport abstraction plus the JSON-RPC over stdio transport.
//!
//! A stdio provider is a child process speaking one JSON object per line:
//! requests go to its stdin, responses come back on its stdout. Closing
//! drops stdin, then terminates and reaps the child.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcRequest, JsonRpcResponse, ProviderSpec};
use crate::process::{terminate_child, Termination};

static REQUEST_IDS: AtomicU64 = AtomicU64::new(1);

/// Process-wide request id, shared by every transport.
pub fn next_request_id() -> u64 {
    REQUEST_IDS.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A request/response channel to one provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `method` and wait for the response carrying the same id.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send `method` without an id.
    async fn notify(&self, method: &str, params: Option<serde_json::Value>)
        -> Result<(), McpError>;

    /// Release every resource held by the transport. Idempotent.
    async fn close(&self, grace: Duration) -> Result<(), McpError>;

    /// Diagnostic context for a failed handshake (e.g. captured stderr).
    async fn failure_context(&self) -> String {
        String::new()
    }

    /// OS process id when the provider runs as a child process.
    fn process_id(&self) -> Option<u32> {
        None
    }
}

// ─── Stdio Transport ─────────────────────────────────────────────────────────

/// JSON-RPC over a provider child's stdin/stdout.
pub struct StdioTransport {
    provider: String,
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<BufReader<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
}

impl StdioTransport {
    /// Launch the provider process described by `spec`.
    ///
    /// The child is spawned with `kill_on_drop`, so dropping the transport
    /// without closing it still kills the process.
    pub fn spawn(spec: &ProviderSpec) -> Result<Self, McpError> {
        let mut cmd = Command::new(&spec.target);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectFailed {
            provider: spec.name.clone(),
            reason: format!("failed to spawn '{}': {e}", spec.target),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(McpError::ConnectFailed {
            provider: spec.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();
        let pid = child.id();

        tracing::debug!(
            provider = %spec.name,
            command = %spec.target,
            pid = ?pid,
            "spawned provider process"
        );

        Ok(Self {
            provider: spec.name.clone(),
            writer: Mutex::new(stdin),
            reader: Mutex::new(BufReader::new(stdout)),
            stderr: Mutex::new(stderr),
            child: Mutex::new(Some(child)),
            pid,
        })
    }

    /// Whether the child is still owned (not yet reaped by `close`).
    pub async fn owns_child(&self) -> bool {
        self.child.lock().await.is_some()
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            provider: self.provider.clone(),
            reason,
        }
    }

    async fn write_line(&self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(message).map_err(|e| {
            self.transport_error(format!("failed to encode {}: {e}", message.method))
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin already closed".into()))?;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| self.transport_error(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("stdin flush failed: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();

        // Hold the reader across the write so concurrent callers cannot
        // consume each other's responses.
        let mut stdout = self.reader.lock().await;
        self.write_line(&JsonRpcRequest::new(id, method, params)).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = stdout
                .read_line(&mut line)
                .await
                .map_err(|e| self.transport_error(format!("stdout read failed: {e}")))?;
            if n == 0 {
                return Err(self.transport_error(
                    "provider stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.numeric_id() == Some(id) => return Ok(resp),
                // Stale response or a notification from the provider.
                Ok(_) => continue,
                // Not JSON-RPC: provider log output on stdout.
                Err(_) => {
                    tracing::trace!(provider = %self.provider, line = trimmed, "skipping non-JSON-RPC line");
                    continue;
                }
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.write_line(&JsonRpcRequest::notification(method, params)).await
    }

    /// Close stdin, then terminate and reap the child.
    async fn close(&self, grace: Duration) -> Result<(), McpError> {
        // EOF on stdin is the polite shutdown request for stdio providers.
        drop(self.writer.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match terminate_child(&mut child, grace).await {
            Ok(outcome) => {
                if outcome == Termination::Killed {
                    tracing::warn!(provider = %self.provider, "provider process force-killed");
                }
                Ok(())
            }
            Err(e) => {
                // Last resort: the Child still has kill_on_drop.
                let _ = child.start_kill();
                Err(self.transport_error(format!("failed to stop process: {e}")))
            }
        }
    }

    async fn failure_context(&self) -> String {
        read_stderr_on_failure(self.stderr.lock().await.take()).await
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }
}

// ─── Diagnostics ─────────────────────────────────────────────────────────────

const STDERR_CAPTURE_LIMIT: usize = 2000;

/// Whatever the child wrote to stderr, capped at `STDERR_CAPTURE_LIMIT` bytes.
/// Gives up after half a second if the child is still running.
async fn read_stderr_on_failure(stderr: Option<ChildStderr>) -> String {
    use tokio::io::AsyncReadExt;

    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut buf = Vec::new();
    let read = stderr.read_to_end(&mut buf);
    if !matches!(tokio::time::timeout(Duration::from_millis(500), read).await, Ok(Ok(_))) {
        return String::new();
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if text.len() > STDERR_CAPTURE_LIMIT {
        let mut cut = STDERR_CAPTURE_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...(truncated)");
    }
    text
}

/// ` | stderr: …` for error messages, or nothing when stderr was empty.
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        [" | stderr: ", stderr.trim()].concat()
    }
}

/// The `result` of a response, or its `error` as `McpError::Server`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    match (response.result, response.error) {
        (_, Some(error)) => Err(McpError::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Err(McpError::Server {
            code: error_codes::INTERNAL_ERROR,
            message: "response carries neither result nor error".into(),
            data: None,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_increase() {
        let first = next_request_id();
        assert!(next_request_id() > first);
    }

    #[test]
    fn test_extract_result_variants() {
        let ok = JsonRpcResponse::success(7.into(), serde_json::json!({"tools": []}));
        assert_eq!(extract_result(ok).unwrap()["tools"], serde_json::json!([]));

        let failed = JsonRpcResponse::failure(7.into(), error_codes::INVALID_PARAMS, "bad args");
        match extract_result(failed).unwrap_err() {
            McpError::Server { code, message, .. } => {
                assert_eq!(code, error_codes::INVALID_PARAMS);
                assert_eq!(message, "bad args");
            }
            other => panic!("expected Server error, got {other:?}"),
        }

        let empty = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 7.into(),
            result: None,
            error: None,
        };
        assert!(matches!(extract_result(empty), Err(McpError::Server { .. })));
    }

    #[test]
    fn test_spawn_missing_executable_is_connect_failure() {
        let spec = ProviderSpec::stdio("ghost", "/nonexistent/toolbridge-provider", vec![]);
        let err = StdioTransport::spawn(&spec).err().unwrap();
        assert!(matches!(err, McpError::ConnectFailed { ref provider, .. } if provider == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_skips_noise_and_matches_id() {
        // A tiny provider: prints a log line, then answers with the id it got.
        let script = r#"read line
id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo "provider booting"
echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"ok\":true}}"
sleep 5"#;
        let spec = ProviderSpec::stdio("echo", "sh", vec!["-c".into(), script.into()]);
        let transport = StdioTransport::spawn(&spec).unwrap();

        let resp = transport.request("ping", None).await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["ok"], true);

        transport.close(Duration::from_secs(2)).await.unwrap();
        assert!(transport.process_id().is_some());
        assert!(!transport.owns_child().await);
        // Second close is a no-op.
        transport.close(Duration::from_secs(2)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_after_exit_reports_closed_stdout() {
        let spec = ProviderSpec::stdio("quitter", "sh", vec!["-c".into(), "echo bye >&2".into()]);
        let transport = StdioTransport::spawn(&spec).unwrap();
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
        assert!(transport.failure_context().await.contains("bye"));
        transport.close(Duration::from_secs(1)).await.unwrap();
    }
}
