//! MCP client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A requested provider name has no configuration.
    #[error("unknown provider: '{name}'")]
    UnknownProvider { name: String },

    /// Every requested provider was dropped or unresolvable.
    #[error("no providers configured (requested: {})", requested.join(", "))]
    NoProvidersConfigured { requested: Vec<String> },

    /// Opening the provider set failed; every opened connection was rolled back.
    #[error("failed to connect to providers (first failure: '{provider}')")]
    ManagerConnect {
        provider: String,
        #[source]
        source: Box<McpError>,
    },

    /// A single transport could not be established.
    #[error("connect failed for provider '{provider}': {reason}")]
    ConnectFailed { provider: String, reason: String },

    /// The capability listing could not be fetched or parsed.
    #[error("failed to load tools from provider '{provider}': {reason}")]
    CapabilityLoad { provider: String, reason: String },

    /// Operation attempted outside the Open state.
    #[error("not connected: {reason}")]
    NotConnected { reason: String },

    /// A specific tool call failed.
    #[error("tool '{tool}' failed: {reason}")]
    Invocation { tool: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for provider '{provider}': {reason}")]
    Transport { provider: String, reason: String },

    /// Provider returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete in time.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// One or more connections failed to close cleanly.
    #[error("failed to close {} connection(s): {}", failures.len(), format_failures(failures))]
    CloseFailed { failures: Vec<(String, String)> },

    /// Configuration error (bad providers file, bad value).
    #[error("config error: {reason}")]
    Config { reason: String },
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl McpError {
    /// Whether this error was produced before any I/O was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            McpError::UnknownProvider { .. }
                | McpError::NoProvidersConfigured { .. }
                | McpError::Config { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_connect_exposes_source() {
        let err = McpError::ManagerConnect {
            provider: "math".into(),
            source: Box::new(McpError::ConnectFailed {
                provider: "math".into(),
                reason: "connection refused".into(),
            }),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("connect failed for provider 'math': connection refused")
        );
    }

    #[test]
    fn test_close_failed_lists_every_failure() {
        let err = McpError::CloseFailed {
            failures: vec![
                ("weather".into(), "broken pipe".into()),
                ("math".into(), "stream reset".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed to close 2 connection(s)"));
        assert!(msg.contains("weather: broken pipe"));
        assert!(msg.contains("math: stream reset"));
    }

    #[test]
    fn test_no_providers_lists_requested() {
        let err = McpError::NoProvidersConfigured {
            requested: vec!["sourcecontrol".into()],
        };
        assert_eq!(err.to_string(), "no providers configured (requested: sourcecontrol)");
        assert!(err.is_validation());
    }
}
