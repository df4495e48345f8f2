//! Mutation-fingerprint table: memoizes file digests.
//!
//! Persists a `StateFile` JSON document at `<root>/.datum/tmp/state.json`,
//! keyed by absolute path. A record is trusted only while the file's
//! `(size, mtime, inode, device)` is unchanged. Writes use the same atomic
//! `.tmp` + rename pattern as the record files.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use datum_core::atomic::write_atomic;
use datum_core::paths;
use datum_core::ContentId;

use crate::error::{io_err, CacheError};

/// Observable identity of a file's current bytes, short of reading them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_ns: i64,
    pub inode: u64,
    pub device: u64,
}

impl Fingerprint {
    pub fn of(meta: &Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                size: meta.len(),
                mtime_ns: mtime_ns(meta),
                inode: meta.ino(),
                device: meta.dev(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                size: meta.len(),
                mtime_ns: mtime_ns(meta),
                inode: 0,
                device: 0,
            }
        }
    }
}

#[cfg(unix)]
fn mtime_ns(meta: &Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
        .saturating_mul(1_000_000_000)
        .saturating_add(meta.mtime_nsec())
}

#[cfg(not(unix))]
fn mtime_ns(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    pub checksum: ContentId,
}

/// On-disk payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub files: HashMap<String, StateRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, StateRecord>,
    dirty: bool,
}

/// Process-wide fingerprint table, safe to share between hashing threads.
#[derive(Debug)]
pub struct StateTable {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl StateTable {
    /// An empty table that will be saved to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Load the repository's table. A missing or unreadable file yields an
    /// empty table; it is a cache and can always be rebuilt.
    pub fn load_at(root: &Path) -> Result<Self, CacheError> {
        Self::load(paths::state_path(root))
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(err) => return Err(io_err(&path, err)),
        };
        let file = match serde_json::from_str::<StateFile>(&contents) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!("discarding unreadable state table {}: {err}", path.display());
                StateFile::default()
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                files: file.files,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored checksum for `path` if its fingerprint still matches `meta`.
    pub fn lookup(&self, path: &Path, meta: &Metadata) -> Option<ContentId> {
        let fingerprint = Fingerprint::of(meta);
        let inner = self.inner.lock().ok()?;
        inner
            .files
            .get(&key(path))
            .filter(|record| record.fingerprint == fingerprint)
            .map(|record| record.checksum.clone())
    }

    /// Upsert the record for `path`. Returns `false` when nothing changed.
    pub fn record(&self, path: &Path, meta: &Metadata, checksum: &ContentId) -> bool {
        let record = StateRecord {
            fingerprint: Fingerprint::of(meta),
            checksum: checksum.clone(),
        };
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let key = key(path);
        if inner.files.get(&key) == Some(&record) {
            return false;
        }
        inner.files.insert(key, record);
        inner.dirty = true;
        true
    }

    pub fn forget(&self, path: &Path) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.files.remove(&key(path)).is_some() {
                inner.dirty = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.files.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the table if it changed since load or the last save.
    pub fn save(&self) -> Result<(), CacheError> {
        let Ok(mut inner) = self.inner.lock() else {
            return Ok(());
        };
        if !inner.dirty {
            return Ok(());
        }
        let file = StateFile {
            files: inner.files.clone(),
        };
        let json = serde_json::to_vec(&file).map_err(|source| CacheError::State {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json)?;
        inner.dirty = false;
        Ok(())
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_table_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let table = StateTable::load_at(tmp.path()).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn record_survives_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.bin");
        std::fs::write(&file, b"hello").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let table = StateTable::load_at(tmp.path()).unwrap();
        assert!(table.record(&file, &meta, &ContentId::from("abc")));
        assert!(!table.record(&file, &meta, &ContentId::from("abc")));
        table.save().unwrap();

        let reloaded = StateTable::load_at(tmp.path()).unwrap();
        assert_eq!(reloaded.lookup(&file, &meta), Some(ContentId::from("abc")));
    }

    #[test]
    fn changed_size_invalidates_record() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.bin");
        std::fs::write(&file, b"hello").unwrap();
        let table = StateTable::empty(tmp.path().join("state.json"));
        table.record(&file, &std::fs::metadata(&file).unwrap(), &ContentId::from("abc"));

        std::fs::write(&file, b"hello, world").unwrap();
        assert_eq!(table.lookup(&file, &std::fs::metadata(&file).unwrap()), None);
    }

    #[test]
    fn garbage_table_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let table = StateTable::load(&path).unwrap();
        assert!(table.is_empty());
    }
}
