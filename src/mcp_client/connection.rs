//! Provider connection lifecycle.
//!
//! A `Connection` owns one transport to one provider and walks the state
//! machine `Closed → Opening → Open | Failed → Closing → Closed`. Opening
//! performs the MCP `initialize` handshake; any failure on that path tears
//! the transport down again (reaping the child for stdio providers) before
//! the error is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::errors::McpError;
use super::sse::SseTransport;
use super::transport::{extract_result, format_stderr_suffix, StdioTransport, Transport};
use super::types::{
    error_codes, InitializeResult, JsonRpcResponse, ProviderSpec, ServerInfo, TransportKind,
    PROTOCOL_VERSION,
};
use crate::process::DEFAULT_SHUTDOWN_GRACE;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single tool call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Time limits applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on transport setup plus `initialize`.
    pub handshake: Duration,
    /// Bound on each `tools/list` page and `tools/call`.
    pub call: Duration,
    /// Grace between termination and force-kill of a stdio provider.
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE_TIMEOUT,
            call: DEFAULT_CALL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
    Failed,
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// The live half of an open connection.
///
/// Owned by its `Connection` through an `Arc`; tool descriptors only keep a
/// `Weak` to it and so can never extend its life past `close()`.
pub struct Session {
    provider: String,
    transport: Box<dyn Transport>,
    open: AtomicBool,
    call_timeout: Duration,
    server_info: Option<ServerInfo>,
}

impl Session {
    /// Provider name this session talks to.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// False once the owning connection began closing.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Server info reported during `initialize`.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Per-call timeout configured for this provider.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// OS process id for stdio providers.
    pub fn process_id(&self) -> Option<u32> {
        self.transport.process_id()
    }

    /// Send a request bounded by the call timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if !self.is_open() {
            return Err(McpError::NotConnected {
                reason: format!("provider '{}' is closed", self.provider),
            });
        }

        tokio::time::timeout(self.call_timeout, self.transport.request(method, params))
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("{}:{method}", self.provider),
                timeout_ms: self.call_timeout.as_millis() as u64,
            })?
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// One provider connection owned by the multi-provider manager.
pub struct Connection {
    spec: Arc<ProviderSpec>,
    timeouts: Timeouts,
    state: ConnectionState,
    session: Option<Arc<Session>>,
}

impl Connection {
    /// A closed connection for `spec`.
    pub fn new(spec: Arc<ProviderSpec>, timeouts: Timeouts) -> Self {
        Self {
            spec,
            timeouts,
            state: ConnectionState::Closed,
            session: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The live session, only while `Open`.
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self.state {
            ConnectionState::Open => self.session.as_ref(),
            _ => None,
        }
    }

    /// Establish the transport and perform the handshake.
    ///
    /// On failure the connection ends in `Failed` with nothing left running.
    pub async fn open(&mut self) -> Result<(), McpError> {
        if self.state == ConnectionState::Open {
            return Ok(());
        }

        self.state = ConnectionState::Opening;
        tracing::info!(
            provider = %self.spec.name,
            transport = %self.spec.transport,
            target = %self.spec.target,
            "opening provider connection"
        );

        // Transport setup and `initialize` share one handshake budget.
        let deadline = tokio::time::Instant::now() + self.timeouts.handshake;

        let transport = match self.establish(deadline).await {
            Ok(transport) => transport,
            Err(e) => {
                self.state = ConnectionState::Failed;
                tracing::warn!(provider = %self.spec.name, error = %e, "provider connect failed");
                return Err(e);
            }
        };

        let handshake = tokio::time::timeout_at(deadline, initialize(transport.as_ref())).await;

        let server_info = match handshake {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return Err(self.abandon(transport, e.to_string()).await),
            Err(_) => {
                let reason = format!(
                    "initialization timed out after {}ms",
                    self.timeouts.handshake.as_millis()
                );
                return Err(self.abandon(transport, reason).await);
            }
        };

        tracing::info!(
            provider = %self.spec.name,
            server = ?server_info.as_ref().and_then(|i| i.name.as_deref()),
            pid = ?transport.process_id(),
            "provider connection open"
        );

        self.session = Some(Arc::new(Session {
            provider: self.spec.name.clone(),
            transport,
            open: AtomicBool::new(true),
            call_timeout: self.timeouts.call,
            server_info,
        }));
        self.state = ConnectionState::Open;
        Ok(())
    }

    /// Release everything acquired by `open`. Idempotent.
    pub async fn close(&mut self) -> Result<(), McpError> {
        let Some(session) = self.session.take() else {
            // Failed opens already released their transport.
            self.state = ConnectionState::Closed;
            return Ok(());
        };

        self.state = ConnectionState::Closing;
        session.open.store(false, Ordering::SeqCst);

        let result = session.transport.close(self.timeouts.shutdown_grace).await;
        self.state = ConnectionState::Closed;

        match &result {
            Ok(()) => tracing::info!(provider = %self.spec.name, "provider connection closed"),
            Err(e) => tracing::error!(provider = %self.spec.name, error = %e, "error closing provider"),
        }
        result
    }

    /// An already-open connection over an in-memory transport.
    #[cfg(test)]
    pub(crate) fn with_transport(
        spec: ProviderSpec,
        transport: Box<dyn Transport>,
        timeouts: Timeouts,
    ) -> Self {
        let session = Session {
            provider: spec.name.clone(),
            transport,
            open: AtomicBool::new(true),
            call_timeout: timeouts.call,
            server_info: None,
        };
        Self {
            spec: Arc::new(spec),
            timeouts,
            state: ConnectionState::Open,
            session: Some(Arc::new(session)),
        }
    }

    async fn establish(
        &self,
        deadline: tokio::time::Instant,
    ) -> Result<Box<dyn Transport>, McpError> {
        match self.spec.transport {
            TransportKind::Stdio => Ok(Box::new(StdioTransport::spawn(&self.spec)?)),
            TransportKind::Sse => {
                let connect = SseTransport::connect(&self.spec);
                match tokio::time::timeout_at(deadline, connect).await {
                    Ok(result) => Ok(Box::new(result?)),
                    Err(_) => Err(McpError::ConnectFailed {
                        provider: self.spec.name.clone(),
                        reason: format!(
                            "timed out after {}ms",
                            self.timeouts.handshake.as_millis()
                        ),
                    }),
                }
            }
        }
    }

    /// Tear down a transport whose handshake failed and build the error.
    async fn abandon(&mut self, transport: Box<dyn Transport>, reason: String) -> McpError {
        let stderr_ctx = transport.failure_context().await;
        if !stderr_ctx.trim().is_empty() {
            tracing::warn!(
                provider = %self.spec.name,
                stderr = %stderr_ctx,
                "provider stderr captured on failure"
            );
        }

        if let Err(e) = transport.close(self.timeouts.shutdown_grace).await {
            tracing::error!(provider = %self.spec.name, error = %e, "cleanup after failed open");
        }
        self.state = ConnectionState::Failed;

        McpError::ConnectFailed {
            provider: self.spec.name.clone(),
            reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
        }
    }
}

/// Perform the MCP initialization handshake.
async fn initialize(transport: &dyn Transport) -> Result<Option<ServerInfo>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult = serde_json::from_value(result).map_err(|e| McpError::Server {
        code: error_codes::INTERNAL_ERROR,
        message: format!("failed to parse initialize response: {e}"),
        data: None,
    })?;

    transport.notify("notifications/initialized", None).await?;
    Ok(init.server_info)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
