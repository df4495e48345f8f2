//! Move workspace content under cache control.
//!
//! Committing a path hashes it, stores every blob (and the directory object
//! for a directory) and replaces the workspace copy with a link into the
//! cache. Content that is already cached and already linked is left alone, so
//! committing an unchanged path twice writes and links nothing.

use std::path::Path;

use datum_core::ContentId;

use crate::error::{io_err, CacheError};
use crate::hasher::{Hashed, Hasher};
use crate::link;
use crate::store::CacheStore;

/// What committing one path did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub id: ContentId,
    /// Objects newly written to the cache.
    pub stored: usize,
    /// Workspace files replaced by links.
    pub linked: usize,
}

/// Commit a file or directory at `path`.
pub fn commit(cache: &CacheStore, hasher: &Hasher, path: &Path) -> Result<Committed, CacheError> {
    match hasher.hash(path)? {
        Hashed::File(id) => {
            let (stored, linked) = commit_file(cache, hasher, path, &id)?;
            Ok(Committed {
                id,
                stored: stored as usize,
                linked: linked as usize,
            })
        }
        Hashed::Dir(id, obj) => {
            let mut report = Committed {
                id,
                stored: 0,
                linked: 0,
            };
            for entry in obj.entries() {
                let file = path.join(&entry.relpath);
                let (stored, linked) = commit_file(cache, hasher, &file, &entry.checksum)?;
                report.stored += stored as usize;
                report.linked += linked as usize;
            }
            if !cache.has(&report.id) {
                cache.save_dir_object(&obj)?;
                report.stored += 1;
            }
            Ok(report)
        }
    }
}

/// Store content without touching the workspace copy; for outputs whose
/// workspace file must stay writable.
pub fn store_only(cache: &CacheStore, hasher: &Hasher, path: &Path) -> Result<ContentId, CacheError> {
    match hasher.hash(path)? {
        Hashed::File(id) => {
            cache.store_file(path, &id)?;
            Ok(id)
        }
        Hashed::Dir(id, obj) => {
            for entry in obj.entries() {
                cache.store_file(&path.join(&entry.relpath), &entry.checksum)?;
            }
            cache.save_dir_object(&obj)?;
            Ok(id)
        }
    }
}

fn commit_file(
    cache: &CacheStore,
    hasher: &Hasher,
    path: &Path,
    id: &ContentId,
) -> Result<(bool, bool), CacheError> {
    let stored = cache.store_file(path, id)?;
    // A read-only workspace file is a link or protected copy of the entry.
    let settled = !stored && link::is_read_only(path).map_err(|e| io_err(path, e))?;
    if settled {
        tracing::debug!("already committed: {}", path.display());
        return Ok((false, false));
    }
    cache.materialize(id, path)?;
    hasher.remember(path, id)?;
    Ok((stored, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateTable;
    use datum_core::LinkType;
    use tempfile::TempDir;

    #[test]
    fn second_commit_of_unchanged_file_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::new(tmp.path().join("cache"), vec![LinkType::Copy]);
        let hasher = Hasher::new(StateTable::empty(tmp.path().join("state.json")));
        let file = tmp.path().join("model.bin");
        std::fs::write(&file, b"weights").unwrap();

        let first = commit(&cache, &hasher, &file).unwrap();
        assert_eq!((first.stored, first.linked), (1, 1));
        assert!(link::is_read_only(&file).unwrap());

        let second = commit(&cache, &hasher, &file).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!((second.stored, second.linked), (0, 0));
        assert_eq!(cache.stats().writes(), 1);
        assert_eq!(cache.stats().links(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn second_commit_through_a_symlink_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::new(tmp.path().join("cache"), vec![LinkType::Symlink]);
        let hasher = Hasher::new(StateTable::empty(tmp.path().join("state.json")));
        let file = tmp.path().join("model.bin");
        std::fs::write(&file, b"weights").unwrap();

        let first = commit(&cache, &hasher, &file).unwrap();
        assert_eq!((first.stored, first.linked), (1, 1));
        let meta = std::fs::symlink_metadata(&file).unwrap();
        assert!(meta.file_type().is_symlink());

        let second = commit(&cache, &hasher, &file).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!((second.stored, second.linked), (0, 0));
        assert_eq!(cache.stats().links(), 1);
        assert_eq!(std::fs::read(&file).unwrap(), b"weights");
    }

    #[test]
    fn directory_commit_stores_entries_and_listing() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::new(tmp.path().join("cache"), vec![LinkType::Copy]);
        let hasher = Hasher::new(StateTable::empty(tmp.path().join("state.json")));
        let dir = tmp.path().join("data");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.csv"), b"1,2").unwrap();
        std::fs::write(dir.join("nested/b.csv"), b"3,4").unwrap();

        let committed = commit(&cache, &hasher, &dir).unwrap();
        assert!(committed.id.is_dir());
        assert_eq!(committed.stored, 3);
        assert_eq!(cache.load_dir_object(&committed.id).unwrap().len(), 2);
    }

    #[test]
    fn store_only_leaves_workspace_writable() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::new(tmp.path().join("cache"), vec![LinkType::Copy]);
        let hasher = Hasher::new(StateTable::empty(tmp.path().join("state.json")));
        let file = tmp.path().join("scores.json");
        std::fs::write(&file, b"{}").unwrap();

        let id = store_only(&cache, &hasher, &file).unwrap();
        assert!(cache.has(&id));
        assert!(!link::is_read_only(&file).unwrap());
    }
}
