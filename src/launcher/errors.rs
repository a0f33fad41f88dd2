//! Process launcher error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors from the process table and its HTTP surface.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// No process with this id is tracked.
    #[error("Process with ID {id} not found")]
    NotFound { id: String },

    /// The command could not be started.
    #[error("Failed to run command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Termination failed (signal delivery or reaping).
    #[error("Error terminating process {id}: {reason}")]
    Terminate { id: String, reason: String },
}

impl LauncherError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LauncherError::NotFound { .. } => StatusCode::NOT_FOUND,
            LauncherError::Spawn { .. } | LauncherError::Terminate { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for LauncherError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "launcher request failed");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}
