//! Error types for the offline POS core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the data layer.
///
/// Remote failures (`Connectivity`, `RemoteQuery`) are what the router
/// falls back on; they are never fatal on their own.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Remote store unreachable or timed out.
    #[error("remote store unreachable: {0}")]
    Connectivity(String),

    /// Remote store answered but rejected the operation.
    #[error("remote query failed (HTTP {status}): {message}")]
    RemoteQuery { status: u16, message: String },

    /// Statement text outside the supported vocabulary.
    #[error("cannot parse statement: {0}")]
    Parse(String),

    /// The local interpreter cannot express the operation.
    #[error("operation not supported offline: {0}")]
    UnsupportedFallbackQuery(String),

    /// Hash mismatch, malformed payload or malformed row.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Bad credentials. The message is safe to show to the user.
    #[error("{0}")]
    Auth(String),

    /// Invalid caller input (e.g. an order total that does not add up).
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("local store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("local store is closed")]
    StoreClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedFallbackQuery(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures that mean "the remote could not be reached".
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// True for any failure of the remote path (the router falls back on these).
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::RemoteQuery { .. })
    }

    /// Human-readable reason for operations the user triggered explicitly.
    pub fn user_message(&self) -> String {
        match self {
            Self::Connectivity(_) => "The central server is unreachable".to_string(),
            Self::RemoteQuery { message, .. } => {
                format!("The central server rejected the request: {message}")
            }
            Self::Auth(message) | Self::Validation(message) => message.clone(),
            Self::UnsupportedFallbackQuery(_) => {
                "This action is not available while offline".to_string()
            }
            Self::StoreClosed => "The terminal is shutting down".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failures_are_classified() {
        assert!(CoreError::connectivity("refused").is_remote_failure());
        assert!(CoreError::RemoteQuery {
            status: 500,
            message: "boom".into()
        }
        .is_remote_failure());
        assert!(!CoreError::parse("DELETE").is_remote_failure());
        assert!(!CoreError::unsupported("insert into admins").is_connectivity());
    }

    #[test]
    fn user_message_hides_transport_details() {
        let err = CoreError::connectivity("tcp connect error: 10.0.0.2:3000");
        assert_eq!(err.user_message(), "The central server is unreachable");

        let err = CoreError::validation("Order total 12.00 does not match line items (13.50)");
        assert!(err.user_message().contains("13.50"));
    }
}
