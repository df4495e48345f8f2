//! Materialize recorded outputs from the cache into the workspace.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use datum_cache::{CacheError, CacheStore, Hasher};
use datum_core::{paths, ContentId, DirObject};

use crate::error::CheckoutError;

/// One output to restore: absolute workspace path and recorded identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutTarget {
    pub path: PathBuf,
    pub id: ContentId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckoutOptions {
    /// Overwrite workspace content that differs from the recorded version.
    pub force: bool,
    /// Delete files inside directory outputs that the recorded listing does
    /// not contain.
    pub cleanup: bool,
}

#[derive(Debug, Default)]
pub struct CheckoutReport {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    /// Files deleted by cleanup.
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, CheckoutError)>,
}

impl CheckoutReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Added,
    Modified,
    Unchanged,
}

/// Restore every target. Failures are per output; the rest proceed.
pub fn checkout(
    cache: &CacheStore,
    hasher: &Hasher,
    targets: &[CheckoutTarget],
    opts: CheckoutOptions,
) -> CheckoutReport {
    let mut report = CheckoutReport::default();
    for target in targets {
        let result = if target.id.is_dir() {
            checkout_dir(cache, hasher, target, opts, &mut report.removed)
        } else {
            checkout_file(cache, hasher, &target.path, &target.id, opts.force)
        };
        match result {
            Ok(Outcome::Added) => report.added.push(target.path.clone()),
            Ok(Outcome::Modified) => report.modified.push(target.path.clone()),
            Ok(Outcome::Unchanged) => {
                tracing::debug!("unchanged: {}", target.path.display());
                report.unchanged.push(target.path.clone());
            }
            Err(err) => {
                tracing::error!("checkout {}: {err}", target.path.display());
                report.failed.push((target.path.clone(), err));
            }
        }
    }
    report
}

enum Presence {
    Missing,
    Matches,
    Differs,
}

/// Compare a workspace path with the identity it should have.
fn compare(hasher: &Hasher, path: &Path, id: &ContentId) -> Result<Presence, CacheError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(Presence::Differs),
        Ok(_) => {
            if &hasher.hash_file(path)? == id {
                Ok(Presence::Matches)
            } else {
                Ok(Presence::Differs)
            }
        }
        // A dangling symlink is present but wrong.
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if std::fs::symlink_metadata(path).is_ok() {
                Ok(Presence::Differs)
            } else {
                Ok(Presence::Missing)
            }
        }
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn checkout_file(
    cache: &CacheStore,
    hasher: &Hasher,
    path: &Path,
    id: &ContentId,
    force: bool,
) -> Result<Outcome, CheckoutError> {
    let outcome = match compare(hasher, path, id)? {
        Presence::Matches => return Ok(Outcome::Unchanged),
        Presence::Differs if !force => {
            return Err(CheckoutError::Conflict {
                path: path.to_path_buf(),
            })
        }
        Presence::Differs => Outcome::Modified,
        Presence::Missing => Outcome::Added,
    };
    cache.materialize(id, path)?;
    hasher.remember(path, id)?;
    Ok(outcome)
}

fn checkout_dir(
    cache: &CacheStore,
    hasher: &Hasher,
    target: &CheckoutTarget,
    opts: CheckoutOptions,
    removed: &mut Vec<PathBuf>,
) -> Result<Outcome, CheckoutError> {
    let obj = cache.load_dir_object(&target.id)?;
    let root = &target.path;

    let existed = match std::fs::symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => true,
        Ok(_) if !opts.force => {
            return Err(CheckoutError::Conflict { path: root.clone() });
        }
        Ok(_) => {
            std::fs::remove_file(root).map_err(|source| CacheError::Io {
                path: root.clone(),
                source,
            })?;
            true
        }
        Err(_) => false,
    };

    // Decide every entry before touching anything so a conflict leaves the
    // directory as it was.
    let mut plan = Vec::new();
    let mut changed = false;
    for entry in obj.entries() {
        let path = root.join(&entry.relpath);
        match compare(hasher, &path, &entry.checksum)? {
            Presence::Matches => {}
            Presence::Differs if !opts.force => {
                return Err(CheckoutError::Conflict { path });
            }
            Presence::Differs => {
                changed = true;
                plan.push((path, &entry.checksum));
            }
            Presence::Missing => plan.push((path, &entry.checksum)),
        }
    }

    let added_any = !plan.is_empty();
    for (path, id) in plan {
        cache.materialize(id, &path)?;
        hasher.remember(&path, id)?;
    }

    let mut cleaned = false;
    if opts.cleanup && existed {
        for extra in extra_files(root, &obj)? {
            std::fs::remove_file(&extra).map_err(|source| CacheError::Io {
                path: extra.clone(),
                source,
            })?;
            tracing::info!("removed untracked {}", extra.display());
            removed.push(extra);
            cleaned = true;
        }
    }

    Ok(match (existed, added_any || changed || cleaned) {
        (false, _) => Outcome::Added,
        (true, true) => Outcome::Modified,
        (true, false) => Outcome::Unchanged,
    })
}

/// Files below `root` that `obj` does not list.
pub fn extra_files(root: &Path, obj: &DirObject) -> Result<Vec<PathBuf>, CacheError> {
    let listed: BTreeSet<&str> = obj.entries().iter().map(|e| e.relpath.as_str()).collect();
    let mut extra = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| CacheError::Io {
            path: root.to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if !listed.contains(paths::to_posix(relative).as_str()) {
            extra.push(entry.path().to_path_buf());
        }
    }
    extra.sort();
    Ok(extra)
}
