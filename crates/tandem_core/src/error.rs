use serde::Serialize;
use thiserror::Error;

/// Unified error type for Tandem operations
///
/// Several of these exist because disk, persistence, and the remote provider
/// are all reached through injected adapters.
#[derive(Debug, Error)]
pub enum TandemError {
    /// General error for any kind of I/O issue not otherwise documented here.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A CRDT update or state vector failed to encode, decode, or apply.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// A per-document persistence database could not be opened, read, or destroyed.
    ///
    /// This is the fatal class from the error taxonomy: the owning state
    /// machine moves to its error state but stays alive, and a later lock
    /// acquisition is allowed to recreate the database.
    #[error("Persistence error for '{db_name}': {message}")]
    Persistence {
        /// Name of the per-document database
        db_name: String,
        /// Description of the failure
        message: String,
    },

    /// A token refresh against the auth provider failed.
    ///
    /// Transient; the store counts attempts and evicts the entry after three
    /// consecutive failures.
    #[error("Token refresh failed for '{guid}': {message}")]
    TokenRefresh {
        /// Document guid the token belongs to
        guid: String,
        /// Description of the failure
        message: String,
    },

    /// A JWT could not be decoded when deriving its expiry.
    #[error("JWT decode error: {0}")]
    Jwt(String),

    /// Serialization failure for persisted state or sidecar metadata.
    ///
    /// Inherited from `serde_json::Error`.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The path/metadata store detected an inconsistency.
    #[error("Sync store error: {0}")]
    Store(String),

    /// Error for invalid path structure (e.g. empty path or missing parent).
    #[error("Invalid path '{path}': {message}")]
    InvalidPath {
        /// Path that is invalid
        path: String,
        /// Description of what's wrong with the path
        message: String,
    },

    /// An async operation was cancelled by a newer operation with the same id.
    ///
    /// Cancellation aborts silently in the state machine; this variant only
    /// surfaces to direct callers of the task helpers.
    #[error("Operation '{0}' was cancelled")]
    Cancelled(String),

    /// An illegal state transition was requested.
    ///
    /// This is a programming bug: panics in debug builds, logged and carried
    /// as data in release builds.
    #[error("Illegal transition from '{from}' to '{to}'")]
    IllegalTransition {
        /// State path the machine was in
        from: String,
        /// State path that was requested
        to: String,
    },
}

/// Result type alias for Tandem operations
pub type Result<T> = std::result::Result<T, TandemError>;

/// A serializable representation of TandemError for IPC with the plugin shell
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Associated path or database name (if applicable)
    pub path: Option<String>,
}

impl From<&TandemError> for SerializableError {
    fn from(err: &TandemError) -> Self {
        let kind = match err {
            TandemError::Io(_) => "Io",
            TandemError::Crdt(_) => "Crdt",
            TandemError::Persistence { .. } => "Persistence",
            TandemError::TokenRefresh { .. } => "TokenRefresh",
            TandemError::Jwt(_) => "Jwt",
            TandemError::Serialization(_) => "Serialization",
            TandemError::Store(_) => "Store",
            TandemError::InvalidPath { .. } => "InvalidPath",
            TandemError::Cancelled(_) => "Cancelled",
            TandemError::IllegalTransition { .. } => "IllegalTransition",
        }
        .to_string();

        let path = match err {
            TandemError::Persistence { db_name, .. } => Some(db_name.clone()),
            TandemError::InvalidPath { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            message: err.to_string(),
            path,
        }
    }
}

impl From<TandemError> for SerializableError {
    fn from(err: TandemError) -> Self {
        SerializableError::from(&err)
    }
}

impl TandemError {
    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// Whether this error came from task cancellation rather than a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TandemError::Cancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializable_error_carries_kind_and_path() {
        let err = TandemError::Persistence {
            db_name: "app-relay-doc-abc".to_string(),
            message: "could not open".to_string(),
        };
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "Persistence");
        assert_eq!(ser.path.as_deref(), Some("app-relay-doc-abc"));
        assert!(ser.message.contains("could not open"));
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(TandemError::Cancelled("idle-merge".to_string()).is_cancellation());
        assert!(!TandemError::Crdt("nope".to_string()).is_cancellation());
    }
}
