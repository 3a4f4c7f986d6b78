//! Error types for dubflow.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DubError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Missing configuration: {}", fields.join(", "))]
    ConfigMissing { fields: Vec<String> },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Remote call errors
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("Quota exceeded: {message}")]
    Quota { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Storage errors
    #[error("Upload of {path} failed: {message}")]
    Upload { path: String, message: String },

    #[error("Failed to delete {key}: {message}")]
    ResourceCleanup { key: String, message: String },

    #[error("Job store {path} is locked by another dubflow process ({holder})")]
    StoreLocked { path: String, holder: String },

    // Input errors
    #[error("Invalid input: {message}")]
    Validation { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Job cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Media toolkit failed: {message}")]
    Media { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used for retry decisions and job error summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Auth,
    Network,
    Timeout,
    Quota,
    Protocol,
    Upload,
    ResourceCleanup,
    Validation,
    NotFound,
    Cancelled,
    Media,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Auth => "auth",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Quota => "quota",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Upload => "upload",
            ErrorKind::ResourceCleanup => "resource_cleanup",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Media => "media",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DubError::ConfigFileNotFound { .. }
            | DubError::ConfigInvalidValue { .. }
            | DubError::ConfigMissing { .. }
            | DubError::Config(_) => ErrorKind::Config,
            DubError::Auth { .. } => ErrorKind::Auth,
            DubError::Network { .. } => ErrorKind::Network,
            DubError::Timeout { .. } => ErrorKind::Timeout,
            DubError::Quota { .. } => ErrorKind::Quota,
            DubError::Protocol { .. } => ErrorKind::Protocol,
            DubError::Upload { .. } => ErrorKind::Upload,
            DubError::ResourceCleanup { .. } => ErrorKind::ResourceCleanup,
            DubError::Validation { .. } => ErrorKind::Validation,
            DubError::NotFound { .. } => ErrorKind::NotFound,
            DubError::Cancelled { .. } => ErrorKind::Cancelled,
            DubError::Media { .. } => ErrorKind::Media,
            DubError::Io(_) | DubError::StoreLocked { .. } => ErrorKind::Io,
            DubError::Json(_) | DubError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures: worth another attempt after a backoff.
    ///
    /// `Upload` covers local I/O and permission failures only; a timed-out or
    /// dropped upload surfaces as `Timeout` or `Network`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Quota
        )
    }

    pub fn is_quota(&self) -> bool {
        self.kind() == ErrorKind::Quota
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        DubError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        DubError::Protocol {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DubError::Validation {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        DubError::Cancelled {
            reason: reason.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, DubError>;

/// Runs `fut` under a per-operation timeout; elapsing becomes `DubError::Timeout`.
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(DubError::timeout(operation, after)),
    }
}
