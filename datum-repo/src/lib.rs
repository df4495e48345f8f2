//! # datum-repo
//!
//! The repository context and the operations the command layer drives:
//! [`Repo::add`], [`Repo::checkout`], [`Repo::push`] / [`Repo::pull`] /
//! [`Repo::fetch`], [`Repo::repro`], [`Repo::status`], [`Repo::gc`],
//! [`Repo::remove`] and [`Repo::unprotect`].
//!
//! Mutating operations hold the repository lock for their whole duration.
//! Operations over many items report per-item failures in aggregate and
//! return an error only when at least one item failed.

mod add;
pub mod error;
mod gc;
mod remove;
pub mod repo;
mod repro;
pub mod status;
pub mod sync;

pub use error::RepoError;
pub use repo::{Repo, TrackedOutput};
pub use status::{StageReport, StatusReport};
pub use sync::SyncRequest;
