//! Error types for embr core operations
//!
//! Every fallible operation in the crate returns [`Result`]. Narrow kinds
//! produced by codecs and transports are folded into a smaller user-visible
//! set with [`ErrorKind::user_visible`].

use std::fmt;

/// Result type for embr operations
pub type Result<T> = std::result::Result<T, EmbrError>;

/// Errors that can occur in the object store, sets, codecs, and remotes
#[derive(Debug, thiserror::Error)]
pub enum EmbrError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),

    #[error("Not an embr repository (or any parent up to /): {0}")]
    NotInitialized(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Ambiguous hash prefix '{prefix}' matches: {}", candidates.join(", "))]
    HashAmbiguous {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("Dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    #[error("I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Out of memory: {0}")]
    Memory(String),

    #[error("Lock failed: {0}")]
    LockFailed(String),

    #[error("Still referenced: {0}")]
    Referenced(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rejected by remote: {0}")]
    Rejected(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Transformer error: {0}")]
    Transformer(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),
}

/// Discriminant of [`EmbrError`], cheap to copy into journal records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    PathTooLong,
    NotInitialized,
    HashMismatch,
    HashAmbiguous,
    DimensionMismatch,
    FileIO,
    Memory,
    LockFailed,
    Referenced,
    Timeout,
    Auth,
    Network,
    Protocol,
    Rejected,
    Conflict,
    InvalidFormat,
    Unsupported,
    Compression,
    Transformer,
    Interrupted,
}

impl EmbrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbrError::InvalidInput(_) => ErrorKind::InvalidInput,
            EmbrError::NotFound(_) => ErrorKind::NotFound,
            EmbrError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EmbrError::PathTooLong(_) => ErrorKind::PathTooLong,
            EmbrError::NotInitialized(_) => ErrorKind::NotInitialized,
            EmbrError::HashMismatch { .. } => ErrorKind::HashMismatch,
            EmbrError::HashAmbiguous { .. } => ErrorKind::HashAmbiguous,
            EmbrError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            EmbrError::FileIO(_) => ErrorKind::FileIO,
            EmbrError::Memory(_) => ErrorKind::Memory,
            EmbrError::LockFailed(_) => ErrorKind::LockFailed,
            EmbrError::Referenced(_) => ErrorKind::Referenced,
            EmbrError::Timeout(_) => ErrorKind::Timeout,
            EmbrError::Auth(_) => ErrorKind::Auth,
            EmbrError::Network(_) => ErrorKind::Network,
            EmbrError::Protocol(_) => ErrorKind::Protocol,
            EmbrError::Rejected(_) => ErrorKind::Rejected,
            EmbrError::Conflict(_) => ErrorKind::Conflict,
            EmbrError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            EmbrError::Unsupported(_) => ErrorKind::Unsupported,
            EmbrError::Compression(_) => ErrorKind::Compression,
            EmbrError::Transformer(_) => ErrorKind::Transformer,
            EmbrError::Interrupted(_) => ErrorKind::Interrupted,
        }
    }

    /// Whether a transport retry could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Interrupted
        )
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        EmbrError::NotFound(what.into())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        EmbrError::InvalidInput(what.into())
    }
}

impl ErrorKind {
    /// Fold a narrow kind into the set surfaced to users by the orchestrator
    pub fn user_visible(self) -> ErrorKind {
        match self {
            ErrorKind::Timeout | ErrorKind::Protocol | ErrorKind::Interrupted => ErrorKind::Network,
            ErrorKind::Rejected => ErrorKind::Auth,
            ErrorKind::Compression | ErrorKind::Transformer | ErrorKind::HashMismatch => {
                ErrorKind::InvalidFormat
            }
            ErrorKind::Memory | ErrorKind::PathTooLong => ErrorKind::FileIO,
            other => other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<serde_json::Error> for EmbrError {
    fn from(e: serde_json::Error) -> Self {
        EmbrError::InvalidFormat(format!("JSON: {}", e))
    }
}

impl From<::parquet::errors::ParquetError> for EmbrError {
    fn from(e: ::parquet::errors::ParquetError) -> Self {
        EmbrError::Transformer(format!("parquet: {}", e))
    }
}

impl From<arrow::error::ArrowError> for EmbrError {
    fn from(e: arrow::error::ArrowError) -> Self {
        EmbrError::Transformer(format!("arrow: {}", e))
    }
}

impl From<reqwest::Error> for EmbrError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EmbrError::Timeout(e.to_string())
        } else if e.status().map(|s| s.as_u16() == 401 || s.as_u16() == 403).unwrap_or(false) {
            EmbrError::Auth(e.to_string())
        } else {
            EmbrError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_user_visible() {
        let err = EmbrError::Timeout("connect".into());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.kind().user_visible(), ErrorKind::Network);
        assert!(err.is_transient());

        let err = EmbrError::Compression("bad frame".into());
        assert_eq!(err.kind().user_visible(), ErrorKind::InvalidFormat);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = EmbrError::HashAmbiguous {
            prefix: "ab".into(),
            candidates: vec!["ab01".into(), "ab02".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("ab01"));
        assert!(msg.contains("ab02"));
    }
}
