//! Content-addressed cache store.
//!
//! Layout: `<cache>/<first 2 hex chars>/<rest>`. Directory objects are stored
//! the same way under their `.dir`-suffixed identity.
//!
//! ## Write protocol
//!
//! 1. Skip if the entry already exists (identity implies content).
//! 2. Stream bytes into a temp file inside the entry's partition directory.
//! 3. Rename over the final path (same filesystem, atomic on POSIX).
//! 4. Mark the entry read-only; cache entries are never mutated in place.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::NamedTempFile;

use datum_core::paths;
use datum_core::{ContentId, DirObject, LinkType};

use crate::error::{io_err, CacheError};
use crate::hasher::{self, walk_err};
use crate::link;

// ---------------------------------------------------------------------------
// Instrumentation
// ---------------------------------------------------------------------------

/// Counters for physical cache writes and workspace link operations.
#[derive(Debug, Default)]
pub struct CacheStats {
    writes: AtomicU64,
    links: AtomicU64,
}

impl CacheStats {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn links(&self) -> u64 {
        self.links.load(Ordering::Relaxed)
    }
}

/// Outcome of a garbage collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed: Vec<ContentId>,
    pub kept: usize,
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    link_types: Vec<LinkType>,
    stats: CacheStats,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>, link_types: Vec<LinkType>) -> Self {
        Self {
            root: root.into(),
            link_types,
            stats: CacheStats::default(),
        }
    }

    /// The cache of the repository rooted at `repo_root`.
    pub fn at_repo(repo_root: &Path, link_types: Vec<LinkType>) -> Self {
        Self::new(paths::cache_dir(repo_root), link_types)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn link_types(&self) -> &[LinkType] {
        &self.link_types
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn path_for(&self, id: &ContentId) -> PathBuf {
        let (head, tail) = id.split();
        self.root.join(head).join(tail)
    }

    /// Presence check only; the content is trusted by address.
    pub fn has(&self, id: &ContentId) -> bool {
        self.path_for(id).symlink_metadata().is_ok()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Open a pending write for `id`. Nothing is visible until
    /// [`PendingObject::commit`]; dropping the pending object discards it.
    pub fn begin(&self, id: &ContentId) -> Result<PendingObject<'_>, CacheError> {
        let dest = self.path_for(id);
        let partition = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&partition).map_err(|e| io_err(&partition, e))?;
        let tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&partition)
            .map_err(|e| io_err(&partition, e))?;
        Ok(PendingObject {
            store: self,
            id: id.clone(),
            dest,
            tmp,
        })
    }

    /// Copy `source` into the cache under `id`. Returns `false` when the
    /// entry already existed.
    pub fn store_file(&self, source: &Path, id: &ContentId) -> Result<bool, CacheError> {
        if self.has(id) {
            tracing::debug!("already cached: {id}");
            return Ok(false);
        }
        let mut pending = self.begin(id)?;
        let mut reader = File::open(source).map_err(|e| io_err(source, e))?;
        std::io::copy(&mut reader, pending.file()).map_err(|e| io_err(source, e))?;
        pending.commit()?;
        Ok(true)
    }

    pub fn store_bytes(&self, id: &ContentId, bytes: &[u8]) -> Result<bool, CacheError> {
        if self.has(id) {
            return Ok(false);
        }
        let mut pending = self.begin(id)?;
        let path = pending.tmp_path().to_path_buf();
        pending.file().write_all(bytes).map_err(|e| io_err(path, e))?;
        pending.commit()?;
        Ok(true)
    }

    /// Store a directory listing under its own identity.
    pub fn save_dir_object(&self, obj: &DirObject) -> Result<ContentId, CacheError> {
        let id = hasher::dir_object_id(obj);
        self.store_bytes(&id, &hasher::encode_dir_object(obj))?;
        Ok(id)
    }

    pub fn load_dir_object(&self, id: &ContentId) -> Result<DirObject, CacheError> {
        if !id.is_dir() {
            return Err(CacheError::Corrupted {
                id: id.clone(),
                reason: "identity is not a directory object".into(),
            });
        }
        let path = self.path_for(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotFound { id: id.clone() })
            }
            Err(err) => return Err(io_err(path, err)),
        };
        hasher::decode_dir_object(id, &bytes)
    }

    // -----------------------------------------------------------------------
    // Materialization
    // -----------------------------------------------------------------------

    /// Produce `dest` with the bytes of blob `id`, using the first configured
    /// strategy that succeeds. Anything already at `dest` is replaced.
    pub fn materialize(&self, id: &ContentId, dest: &Path) -> Result<LinkType, CacheError> {
        let src = self.path_for(id);
        if !src.is_file() {
            return Err(CacheError::NotFound { id: id.clone() });
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        remove_existing(dest)?;
        let kind = link::link_first(&self.link_types, &src, dest).map_err(|failures| {
            CacheError::LinkFailed {
                path: dest.to_path_buf(),
                attempts: failures
                    .into_iter()
                    .map(|(kind, err)| (kind, err.to_string()))
                    .collect(),
            }
        })?;
        if matches!(kind, LinkType::Copy | LinkType::Reflink) {
            protect(dest)?;
        }
        self.stats.links.fetch_add(1, Ordering::Relaxed);
        tracing::info!("{kind} {} -> {}", id, dest.display());
        Ok(kind)
    }

    // -----------------------------------------------------------------------
    // Enumeration and garbage collection
    // -----------------------------------------------------------------------

    /// Every identity present in the cache, sorted.
    pub fn list_ids(&self) -> Result<Vec<ContentId>, CacheError> {
        let mut ids = Vec::new();
        let partitions = match std::fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(io_err(&self.root, err)),
        };
        for partition in partitions {
            let partition = partition.map_err(|e| io_err(&self.root, e))?;
            let head = partition.file_name().to_string_lossy().into_owned();
            if head.len() != 2 || !partition.path().is_dir() {
                continue;
            }
            let dir = partition.path();
            for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let tail = entry.file_name().to_string_lossy().into_owned();
                if tail.starts_with(".tmp") {
                    continue;
                }
                if let Some(id) = ContentId::from_object_key(&format!("{head}/{tail}")) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// `ids` plus every entry of every directory object among them that is
    /// present locally. Missing directory objects are skipped.
    pub fn expand(&self, ids: &BTreeSet<ContentId>) -> Result<BTreeSet<ContentId>, CacheError> {
        let mut out = ids.clone();
        for id in ids.iter().filter(|id| id.is_dir()) {
            match self.load_dir_object(id) {
                Ok(obj) => out.extend(obj.entries().iter().map(|e| e.checksum.clone())),
                Err(CacheError::NotFound { .. }) => {
                    tracing::debug!("directory object {id} not cached; entries unknown");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Remove every entry not reachable from `live`.
    pub fn collect_garbage(&self, live: &BTreeSet<ContentId>) -> Result<GcReport, CacheError> {
        let reachable = self.expand(live)?;
        let mut report = GcReport::default();
        for id in self.list_ids()? {
            if reachable.contains(&id) {
                report.kept += 1;
                continue;
            }
            let path = self.path_for(&id);
            std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            tracing::info!("removed unreferenced object {id}");
            if let Some(partition) = path.parent() {
                // Fails harmlessly while the partition still holds entries.
                let _ = std::fs::remove_dir(partition);
            }
            report.removed.push(id);
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Pending writes
// ---------------------------------------------------------------------------

/// A cache entry being written; see [`CacheStore::begin`].
pub struct PendingObject<'a> {
    store: &'a CacheStore,
    id: ContentId,
    dest: PathBuf,
    tmp: NamedTempFile,
}

impl PendingObject<'_> {
    pub fn file(&mut self) -> &mut File {
        self.tmp.as_file_mut()
    }

    pub fn tmp_path(&self) -> &Path {
        self.tmp.path()
    }

    pub fn id(&self) -> &ContentId {
        &self.id
    }

    /// Rename into place and mark read-only.
    pub fn commit(self) -> Result<(), CacheError> {
        let dest = self.dest;
        self.tmp.as_file().sync_all().map_err(|e| io_err(&dest, e))?;
        self.tmp
            .persist(&dest)
            .map_err(|e| io_err(&dest, e.error))?;
        link::set_read_only(&dest).map_err(|e| io_err(&dest, e))?;
        self.store.stats.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("stored {}", self.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Protection
// ---------------------------------------------------------------------------

/// Mark a workspace file read-only. Symlinks are left alone; their target is
/// the read-only cache entry.
pub fn protect(path: &Path) -> Result<(), CacheError> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| io_err(path, e))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    link::set_read_only(path).map_err(|e| io_err(path, e))
}

/// Make a workspace file (or every file below a directory) safe to edit:
/// links into the cache are replaced by independent writable copies.
pub fn unprotect(path: &Path) -> Result<(), CacheError> {
    let meta = std::fs::symlink_metadata(path).map_err(|e| io_err(path, e))?;
    if meta.is_dir() {
        for entry in walkdir::WalkDir::new(path).min_depth(1) {
            let entry = entry.map_err(|e| walk_err(path, e))?;
            if !entry.file_type().is_dir() {
                unprotect_file(entry.path())?;
            }
        }
        return Ok(());
    }
    unprotect_file(path)
}

fn unprotect_file(path: &Path) -> Result<(), CacheError> {
    if link::shares_storage(path).map_err(|e| io_err(path, e))? {
        let tmp = datum_core::atomic::tmp_sibling(path);
        std::fs::copy(path, &tmp).map_err(|e| io_err(&tmp, e))?;
        link::set_writable(&tmp).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(path, e));
        }
        tracing::debug!("unlinked {}", path.display());
        return Ok(());
    }
    link::set_writable(path).map_err(|e| io_err(path, e))
}

fn remove_existing(path: &Path) -> Result<(), CacheError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path).map_err(|e| io_err(path, e)),
        Ok(_) => std::fs::remove_file(path).map_err(|e| io_err(path, e)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
