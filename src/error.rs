use thiserror::Error;

/// Error types for exporter operations.
///
/// Covers configuration errors, GitLab API failures, network issues, and
/// store access problems.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("GitLab API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Tier detection failed: {0}")]
    TierDetection(String),

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("GraphQL response contained no data")]
    NoResponseData,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ExporterError {
    /// HTTP status carried by this error, when the underlying failure was an
    /// API response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Network(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type alias using `ExporterError` as the error type.
pub type Result<T> = std::result::Result<T, ExporterError>;
