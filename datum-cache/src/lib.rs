//! # datum-cache
//!
//! Content hashing and the local content-addressed cache.
//!
//! [`Hasher`] computes identities for files and directories, memoized through
//! the on-disk [`StateTable`]. [`CacheStore`] stores blobs and directory
//! objects and materializes them into the workspace with the configured link
//! strategies.

pub mod commit;
pub mod error;
pub mod hasher;
pub mod link;
pub mod state;
pub mod store;

pub use commit::{commit, Committed};
pub use error::CacheError;
pub use hasher::{Hashed, Hasher, LARGE_DIR_SIZE};
pub use state::StateTable;
pub use store::{protect, unprotect, CacheStats, CacheStore, GcReport, PendingObject};
