use thiserror::Error;

/// Errors surfaced by [`SessionStore`](crate::auth::SessionStore) operations.
///
/// Clone so a single in-flight refresh outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),

    #[error("Stored session is corrupt: {0}")]
    StorageCorrupt(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),
}

/// Errors raised by a [`KeyValueStore`](crate::storage::KeyValueStore) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage quota exceeded ({used} of {quota} bytes)")]
    QuotaExceeded { used: usize, quota: usize },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Errors from encoding or decoding a persisted session record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed encoding: {0}")]
    Malformed(String),

    #[error("Record failed authentication")]
    Unauthenticated,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Malformed(e.to_string())
    }
}

impl From<base64::DecodeError> for CodecError {
    fn from(e: base64::DecodeError) -> Self {
        CodecError::Malformed(e.to_string())
    }
}
