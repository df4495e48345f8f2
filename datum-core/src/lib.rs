//! datum core library: data model, declarative records, configuration, errors.
//!
//! Public API surface:
//! - [`types`]: content identities, directory objects, stages and their outputs
//! - [`pipeline_file`]: `datum.yaml` stage definitions
//! - [`lockfile`]: `datum.lock` last-known-good records
//! - [`tracking`]: `*.datum` single-output tracking records
//! - [`config`]: `.datum/config.yaml` and remote management
//! - [`lock`]: exclusive repository lock
//! - [`error`]: [`CoreError`], [`StructuralError`]

pub mod atomic;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod lock;
pub mod lockfile;
pub mod paths;
pub mod pipeline_file;
pub mod tracking;
pub mod types;

pub use error::{CoreError, InvalidContentId, StructuralError};
pub use interrupt::Interrupt;
pub use types::{
    ContentId, Dependency, DirEntry, DirObject, LinkType, Output, OutputKind, ParamDependency,
    Stage, StageKind,
};
