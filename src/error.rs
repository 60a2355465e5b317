//! Error types for the delta server

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias using the delta server Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, building or serving a delta
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or mismatched image references, missing parameters
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid bearer token
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Another actor holds the build lock for this key
    #[error("delta {key} is already being built")]
    AlreadyBuilding { key: String },

    /// Any failure in the pull / diff / publish pipeline
    #[error("delta build failed: {0}")]
    Build(String),

    /// Download of a key that was never stored
    #[error("delta {0} not found")]
    NotFound(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// An external command exited unsuccessfully
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    /// Registry HTTP errors
    #[error("registry error: {0}")]
    Registry(#[from] delta_oci::OciError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status for this error.  Busy maps to 504 because device
    /// supervisors treat gateway timeouts as "retry later".
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Build(_) | Error::Command { .. } | Error::Registry(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::AlreadyBuilding { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) | Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short message safe to put in a response body.  External command output
    /// and registry bodies stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::Auth(_) => "authorization failed".to_string(),
            Error::AlreadyBuilding { .. } => "delta build in progress".to_string(),
            Error::Build(msg) => format!("delta build failed: {msg}"),
            Error::NotFound(key) => format!("delta {key} not found"),
            Error::Command { program, .. } => format!("{program} failed"),
            Error::Registry(_) => "registry request failed".to_string(),
            Error::Config(_) | Error::Io(_) | Error::Json(_) => "internal error".to_string(),
        }
    }
}
