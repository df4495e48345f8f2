//! Error types for datum-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing repository records and configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path and serde_yaml line context.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error on a machine-owned file (lock owner, state table).
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Structurally valid YAML whose content is not a valid record.
    #[error("invalid record in {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    /// The directory is not a datum repository.
    #[error("not a datum repository (missing {path})")]
    NotARepository { path: PathBuf },

    /// Another live process holds the repository lock.
    #[error("repository is locked by running process {pid} ({path})")]
    Locked { pid: u32, path: PathBuf },

    #[error("remote '{name}' doesn't exist")]
    UnknownRemote { name: String },

    #[error("remote '{name}' already exists; use force to overwrite it")]
    DuplicateRemote { name: String },

    #[error("no remote specified and no default remote configured")]
    NoDefaultRemote,
}

/// Graph-shape errors detected before any stage executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// Two stages declare the very same output path.
    #[error("output '{path}' is declared by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// One stage's output is an ancestor directory of another's.
    #[error("output '{parent}' of '{parent_stage}' overlaps output '{child}' of '{child_stage}'")]
    OverlappingOutputs {
        parent: PathBuf,
        parent_stage: String,
        child: PathBuf,
        child_stage: String,
    },

    /// The dependency graph contains a cycle; stages are listed in cycle order.
    #[error("pipeline has a cycle: {}", .stages.join(" -> "))]
    Cycle { stages: Vec<String> },

    /// Two stages share a name.
    #[error("stage '{name}' is defined more than once")]
    DuplicateStage { name: String },
}

/// A textual identity that is not lowercase hex with an optional `.dir`
/// suffix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a content identity")]
pub struct InvalidContentId(pub String);

/// Convenience constructor for [`CoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_every_stage() {
        let err = StructuralError::Cycle {
            stages: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "pipeline has a cycle: a -> b -> a");
    }

    #[test]
    fn io_err_keeps_path() {
        let err = io_err("/x/y", std::io::Error::other("boom"));
        assert!(err.to_string().contains("/x/y"));
    }
}
