//! Error types for datum-pipeline.

use std::path::PathBuf;

use thiserror::Error;

use datum_cache::CacheError;
use datum_core::{CoreError, StructuralError};

/// Errors raised while evaluating or executing one stage, or while loading
/// the pipeline.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("stage '{name}' does not exist")]
    UnknownStage { name: String },

    /// The command ran and exited unsuccessfully.
    #[error("command of stage '{stage}' failed: {status}")]
    CommandFailed { stage: String, status: String },

    #[error("failed to start command of stage '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// The command was terminated by an interrupt.
    #[error("stage '{stage}' was interrupted")]
    Interrupted { stage: String },

    #[error("dependency '{path}' of stage '{stage}' does not exist")]
    DependencyMissing { stage: String, path: PathBuf },

    /// The command succeeded without producing a declared output.
    #[error("stage '{stage}' did not produce output '{path}'")]
    OutputMissing { stage: String, path: PathBuf },

    #[error("parameter '{key}' is missing from {file}")]
    ParamMissing { file: PathBuf, key: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_pass_through_unchanged() {
        let inner = StructuralError::DuplicateStage { name: "train".into() };
        let err = StageError::from(inner.clone());
        assert_eq!(err.to_string(), inner.to_string());
    }
}
