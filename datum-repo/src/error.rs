//! Error types for datum-repo.

use std::path::PathBuf;

use thiserror::Error;

use datum_cache::CacheError;
use datum_core::{CoreError, StructuralError};
use datum_pipeline::{ExecutorResult, StageError};
use datum_sync::{CheckoutReport, SyncError, TransferSummary};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("'{path}' is already a datum repository; use force to reinitialize")]
    AlreadyInitialized { path: PathBuf },

    #[error("'{path}' is outside the repository")]
    OutsideRepository { path: PathBuf },

    #[error("'{path}' does not exist")]
    PathNotFound { path: PathBuf },

    #[error("'{path}' is an output of stage '{stage}'; it is tracked by the pipeline")]
    StageOutput { path: PathBuf, stage: String },

    #[error("'{target}' is neither a stage, a tracking record nor a tracked output")]
    UnknownTarget { target: String },

    /// Some objects did not transfer; the summary lists them.
    #[error(
        "{} object(s) failed to transfer, {} cancelled",
        .0.failed.len(),
        .0.cancelled.len()
    )]
    TransferFailed(Box<TransferSummary>),

    #[error("{} output(s) could not be checked out", .0.failed.len())]
    CheckoutFailed(Box<CheckoutReport>),

    /// Either half of a pull failed; both outcomes are kept.
    #[error(
        "pull incomplete: {} object(s) failed to transfer, {} cancelled, {} output(s) not checked out",
        .transfer.failed.len(),
        .transfer.cancelled.len(),
        .checkout.failed.len()
    )]
    PullFailed {
        transfer: Box<TransferSummary>,
        checkout: Box<CheckoutReport>,
    },

    #[error("{} stage(s) failed: {}", .0.failed.len(), .0.failed_names().join(", "))]
    ReproFailed(Box<ExecutorResult>),
}
