//! Stage staleness detection.
//!
//! Signal precedence (the first match wins):
//! 1. `Frozen` (never stale, nothing else is checked)
//! 2. `NeverRun` (no lock record)
//! 3. `AlwaysChanged`
//! 4. `CommandChanged`
//! 5. `DependencyMissing` / `DependencyChanged`
//! 6. `ParamChanged`
//! 7. `OutputMissing` / `OutputChanged` (workspace differs from the record)
//! 8. `OutputNotCached` (cacheable output absent from the cache)
//!
//! Tracking records have no command; they are stale when their tracked
//! content no longer matches the recorded identity.

use std::fmt;
use std::path::{Path, PathBuf};

use datum_cache::{CacheError, CacheStore, Hasher};
use datum_core::lockfile::LockRecord;
use datum_core::{ContentId, Stage};

use crate::error::StageError;
use crate::params;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NeverRun,
    AlwaysChanged,
    CommandChanged,
    DependencyMissing { path: PathBuf },
    DependencyChanged { path: PathBuf },
    ParamChanged { file: PathBuf, key: String },
    OutputMissing { path: PathBuf },
    OutputChanged { path: PathBuf },
    OutputNotCached { path: PathBuf },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NeverRun => write!(f, "never run"),
            StaleReason::AlwaysChanged => write!(f, "always changed"),
            StaleReason::CommandChanged => write!(f, "command changed"),
            StaleReason::DependencyMissing { path } => {
                write!(f, "dependency {} missing", path.display())
            }
            StaleReason::DependencyChanged { path } => {
                write!(f, "dependency {} changed", path.display())
            }
            StaleReason::ParamChanged { file, key } => {
                write!(f, "param {key} in {} changed", file.display())
            }
            StaleReason::OutputMissing { path } => write!(f, "output {} missing", path.display()),
            StaleReason::OutputChanged { path } => write!(f, "output {} modified", path.display()),
            StaleReason::OutputNotCached { path } => {
                write!(f, "output {} not in cache", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Current,
    Frozen,
    Stale { reason: StaleReason },
}

impl StageStatus {
    pub fn is_stale(&self) -> bool {
        matches!(self, StageStatus::Stale { .. })
    }
}

/// Evaluation context shared by every staleness check of one command.
#[derive(Debug, Clone, Copy)]
pub struct Checker<'a> {
    pub root: &'a Path,
    pub cache: &'a CacheStore,
    pub hasher: &'a Hasher,
}

impl<'a> Checker<'a> {
    pub fn new(root: &'a Path, cache: &'a CacheStore, hasher: &'a Hasher) -> Self {
        Self {
            root,
            cache,
            hasher,
        }
    }

    /// Classify `stage` against its lock record.
    pub fn check(&self, stage: &Stage, lock: Option<&LockRecord>) -> Result<StageStatus, StageError> {
        if stage.frozen {
            return Ok(StageStatus::Frozen);
        }
        if stage.is_tracking() {
            return self.check_tracked(stage);
        }
        let Some(lock) = lock else {
            return Ok(stale(StaleReason::NeverRun));
        };
        if stage.always_changed {
            return Ok(stale(StaleReason::AlwaysChanged));
        }
        if stage.cmd.as_deref() != Some(lock.cmd.as_str()) {
            return Ok(stale(StaleReason::CommandChanged));
        }

        for dep in &stage.deps {
            let path = self.root.join(stage.resolve(&dep.path));
            let Some(current) = self.identity(&path)? else {
                return Ok(stale(StaleReason::DependencyMissing {
                    path: dep.path.clone(),
                }));
            };
            if lock.dep_checksum(&dep.path) != Some(&current) {
                return Ok(stale(StaleReason::DependencyChanged {
                    path: dep.path.clone(),
                }));
            }
        }

        let current = params::current_values(self.root, stage)?;
        for dep in &stage.params {
            for key in &dep.keys {
                let now = current.get(&dep.file).and_then(|v| v.get(key));
                let then = lock.params.get(&dep.file).and_then(|v| v.get(key));
                if now.is_none() || now != then {
                    return Ok(stale(StaleReason::ParamChanged {
                        file: dep.file.clone(),
                        key: key.clone(),
                    }));
                }
            }
        }

        for out in &stage.outs {
            let path = self.root.join(stage.resolve(&out.path));
            let Some(current) = self.identity(&path)? else {
                return Ok(stale(StaleReason::OutputMissing {
                    path: out.path.clone(),
                }));
            };
            let Some(recorded) = lock.out_checksum(&out.path) else {
                return Ok(stale(StaleReason::OutputChanged {
                    path: out.path.clone(),
                }));
            };
            if recorded != &current {
                return Ok(stale(StaleReason::OutputChanged {
                    path: out.path.clone(),
                }));
            }
            if out.cache && !self.fully_cached(recorded)? {
                return Ok(stale(StaleReason::OutputNotCached {
                    path: out.path.clone(),
                }));
            }
        }

        Ok(StageStatus::Current)
    }

    fn check_tracked(&self, stage: &Stage) -> Result<StageStatus, StageError> {
        for out in &stage.outs {
            let path = self.root.join(stage.resolve(&out.path));
            let Some(current) = self.identity(&path)? else {
                return Ok(stale(StaleReason::OutputMissing {
                    path: out.path.clone(),
                }));
            };
            if out.checksum.as_ref() != Some(&current) {
                return Ok(stale(StaleReason::OutputChanged {
                    path: out.path.clone(),
                }));
            }
        }
        Ok(StageStatus::Current)
    }

    /// Identity of a workspace path, `None` when it does not exist.
    fn identity(&self, path: &Path) -> Result<Option<ContentId>, StageError> {
        if std::fs::metadata(path).is_err() {
            return Ok(None);
        }
        Ok(Some(self.hasher.hash(path)?.into_id()))
    }

    fn fully_cached(&self, id: &ContentId) -> Result<bool, StageError> {
        if !self.cache.has(id) {
            return Ok(false);
        }
        if !id.is_dir() {
            return Ok(true);
        }
        match self.cache.load_dir_object(id) {
            Ok(obj) => Ok(obj.entries().iter().all(|e| self.cache.has(&e.checksum))),
            Err(CacheError::Corrupted { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn stale(reason: StaleReason) -> StageStatus {
    StageStatus::Stale { reason }
}
