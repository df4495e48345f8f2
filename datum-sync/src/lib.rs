//! # datum-sync
//!
//! Remote object stores and the sync engine.
//!
//! A [`RemotePort`] is the only way the engine talks to remote storage;
//! [`open_remote`] picks the adapter for a configured URL. [`status`]
//! classifies content identities against the cache and a remote, [`push`] and
//! [`fetch`] move objects in bulk, and [`checkout`] materializes recorded
//! outputs from the cache into the workspace.

pub mod checkout;
pub mod error;
pub mod local;
pub mod objectstore;
pub mod remote;
pub mod status;
pub mod transfer;

pub use checkout::{checkout, CheckoutOptions, CheckoutReport, CheckoutTarget};
pub use error::{CheckoutError, RemoteError, SyncError, TransferError};
pub use local::LocalRemote;
pub use objectstore::ObjectStoreRemote;
pub use remote::{list_ids, open_remote, RemotePort};
pub use status::{status, SyncStatus};
pub use transfer::{fetch, push, RetryPolicy, TransferOptions, TransferSummary};
