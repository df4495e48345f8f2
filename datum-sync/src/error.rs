//! Error types for datum-sync.

use std::path::PathBuf;

use thiserror::Error;

use datum_cache::CacheError;
use datum_core::ContentId;

/// What a remote backend surfaces for one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("'{key}' not found on remote")]
    NotFound { key: String },

    #[error("access denied to '{key}': {message}")]
    AccessDenied { key: String, message: String },

    /// Worth retrying: timeouts, dropped connections, throttling.
    #[error("transient failure on '{key}': {message}")]
    Transient { key: String, message: String },

    #[error("remote failure on '{key}': {message}")]
    Permanent { key: String, message: String },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    /// Classify a local I/O error raised while talking to `key`.
    pub fn from_io(key: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let key = key.to_string();
        let message = err.to_string();
        match err.kind() {
            NotFound => RemoteError::NotFound { key },
            PermissionDenied => RemoteError::AccessDenied { key, message },
            Interrupted | TimedOut | WouldBlock | ConnectionReset | ConnectionAborted
            | BrokenPipe => RemoteError::Transient { key, message },
            _ => RemoteError::Permanent { key, message },
        }
    }
}

/// Failure of one object inside a bulk transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Downloaded bytes do not hash to the requested identity.
    #[error("checksum mismatch for {id}: downloaded content hashes to {actual}")]
    ChecksumMismatch { id: ContentId, actual: ContentId },

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A directory object was held back because some entries did not transfer.
    #[error("{missing} entries of directory {id} did not transfer")]
    IncompleteDirectory { id: ContentId, missing: usize },

    /// The transfer worker died.
    #[error("transfer worker failed: {0}")]
    Worker(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Remote(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Failure to check out one output.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("'{path}' differs from the recorded version; use force to overwrite it")]
    Conflict { path: PathBuf },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Top-level failures that stop a sync operation before per-object work.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to start transfer runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid remote url '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("interrupted")]
    Interrupted,
}
