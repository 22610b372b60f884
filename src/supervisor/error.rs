//! Error taxonomy shared by every lifecycle operation. Each variant maps to an
//! HTTP status and a machine-readable code so IPC handlers can return it as-is.

use std::path::PathBuf;

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Instance '{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Instance '{0}' is not installed. Install it first.")]
    NotInstalled(String),

    #[error("Server executable not found at {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("Path '{0}' escapes the instance directory")]
    InvalidPath(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Instance '{0}' is not running")]
    NotRunning(String),

    #[error("{message}")]
    SubprocessFailure {
        message: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Wrap an I/O error with the operation and path it happened on.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotInstalled(_)
            | Self::InvalidPath(_)
            | Self::InvalidRequest(_)
            | Self::NotRunning(_) => StatusCode::BAD_REQUEST,
            Self::ExecutableMissing(_)
            | Self::SubprocessFailure { .. }
            | Self::Io { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::NotInstalled(_) => "NOT_INSTALLED",
            Self::ExecutableMissing(_) => "EXECUTABLE_MISSING",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::SubprocessFailure { .. } => "SUBPROCESS_FAILURE",
            Self::Io { .. } => "IO_FAILURE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        });
        if let Self::SubprocessFailure { code, output, .. } = self {
            body["exit_code"] = serde_json::json!(code);
            body["output"] = serde_json::json!(output);
        }
        body
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        if self.status_code().is_server_error() {
            tracing::error!("{}", self);
        }
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
