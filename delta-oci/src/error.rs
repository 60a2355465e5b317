/// Errors produced by the OCI client.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid image reference: {0}")]
    Reference(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("authentication failed for {0}")]
    Unauthorized(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
