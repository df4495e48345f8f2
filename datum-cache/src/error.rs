//! Error types for datum-cache.

use std::path::PathBuf;

use thiserror::Error;

use datum_core::{ContentId, CoreError, LinkType};

/// Errors raised by the hasher and the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The object is not present in the cache.
    #[error("object {id} not found in cache")]
    NotFound { id: ContentId },

    /// A stored directory object could not be decoded.
    #[error("corrupted directory object {id}: {reason}")]
    Corrupted { id: ContentId, reason: String },

    /// Every configured link strategy failed for one destination.
    #[error("all link strategies failed for {path}: {}", describe_attempts(.attempts))]
    LinkFailed {
        path: PathBuf,
        attempts: Vec<(LinkType, String)>,
    },

    /// The mutation-fingerprint table could not be read or written.
    #[error("state table error at {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

fn describe_attempts(attempts: &[(LinkType, String)]) -> String {
    if attempts.is_empty() {
        return "no link strategy configured".into();
    }
    attempts
        .iter()
        .map(|(kind, err)| format!("{kind}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience constructor for [`CacheError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_failure_lists_every_attempt() {
        let err = CacheError::LinkFailed {
            path: PathBuf::from("data/x"),
            attempts: vec![
                (LinkType::Hardlink, "cross-device link".into()),
                (LinkType::Copy, "disk full".into()),
            ],
        };
        assert_eq!(
            err.to_string(),
            "all link strategies failed for data/x: hardlink: cross-device link; copy: disk full"
        );
    }
}
