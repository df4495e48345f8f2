//! Exclusive repository lock.
//!
//! The lock is a PID file at `.datum/tmp/repo.lock`, created with
//! `create_new` so that exactly one process wins. A lock whose owner is no
//! longer alive is cleared and re-acquired; the file is removed when the
//! guard drops, including on error paths.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::paths;

/// A freshly created lock file may be observed before its owner wrote it.
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Guard for the repository lock; released on drop.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    /// Acquire the lock for the repository at `root`.
    pub fn acquire(root: &Path) -> Result<Self, CoreError> {
        Self::acquire_at(&paths::repo_lock_path(root))
    }

    /// Acquire a lock file at an explicit path.
    pub fn acquire_at(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let owner = LockOwner {
                        pid: std::process::id(),
                        started_at: Utc::now(),
                    };
                    let json = serde_json::to_vec(&owner).map_err(|source| CoreError::Json {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    file.write_all(&json).map_err(|e| io_err(path, e))?;
                    file.sync_all().map_err(|e| io_err(path, e))?;
                    tracing::debug!(path = %path.display(), "acquired repository lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match read_owner(path) {
                        Some(owner) if is_process_alive(owner.pid) => {
                            return Err(CoreError::Locked {
                                pid: owner.pid,
                                path: path.to_path_buf(),
                            });
                        }
                        Some(owner) => {
                            tracing::warn!(
                                pid = owner.pid,
                                since = %owner.started_at,
                                "removing stale repository lock"
                            );
                        }
                        None if recently_modified(path) => {
                            return Err(CoreError::Locked {
                                pid: 0,
                                path: path.to_path_buf(),
                            });
                        }
                        None => {
                            tracing::warn!(path = %path.display(), "removing unreadable repository lock");
                        }
                    }
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(io_err(path, err)),
                    }
                }
                Err(err) => return Err(io_err(path, err)),
            }
        }

        Err(io_err(
            path,
            std::io::Error::other("repository lock kept reappearing"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(error = %err, "failed to release repository lock");
            }
        }
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn recently_modified(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age < UNREADABLE_GRACE)
}

/// Check liveness with the null signal.
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: the process exists but belongs to someone else.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
