//! Error types for the mirror pipeline
//!
//! One flat enum with string payloads. Conversions from the driver and
//! codec errors happen here so call sites can use `?` everywhere.

use mongodb::error::{ErrorKind, WriteFailure};

/// MongoDB server code for a unique index violation
pub const DUPLICATE_KEY_CODE: i32 = 11000;

/// Main error type for mirror operations
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Malformed upstream data: {0}")]
    Malformed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Whether a retry after a delay may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Database(_))
    }

    /// Whether this is a unique-key conflict on insert
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Check a driver error for the duplicate-key server code
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

impl From<mongodb::error::Error> for MirrorError {
    fn from(err: mongodb::error::Error) -> Self {
        if is_duplicate_key(&err) {
            Self::Duplicate(err.to_string())
        } else {
            Self::Database(err.to_string())
        }
    }
}

impl From<bson::de::Error> for MirrorError {
    fn from(err: bson::de::Error) -> Self {
        Self::Malformed(format!("BSON decode: {}", err))
    }
}

impl From<bson::ser::Error> for MirrorError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Internal(format!("BSON encode: {}", err))
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(err: reqwest::Error) -> Self {
        Self::Rpc(err.to_string())
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MirrorError::Rpc("timeout".into()).is_transient());
        assert!(MirrorError::Database("no primary".into()).is_transient());
        assert!(!MirrorError::Malformed("bad op".into()).is_transient());
        assert!(!MirrorError::Duplicate("E11000".into()).is_transient());
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err: MirrorError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, MirrorError::Malformed(_)));
    }
}
