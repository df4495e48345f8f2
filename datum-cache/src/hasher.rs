//! Content hashing for files and directories.
//!
//! Files are streamed through SHA-256 with a bounded buffer. Directory
//! identities are a pure fold over their children: each file below the
//! directory becomes a [`DirEntry`], entries are sorted by relative path, the
//! listing is serialized to JSON and the digest of that serialization plus the
//! `.dir` suffix is the directory's [`ContentId`].
//!
//! File digests are memoized through the [`StateTable`]; a file whose
//! fingerprint is unchanged is never re-read.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use datum_core::paths;
use datum_core::{ContentId, DirEntry, DirObject};

use crate::error::{io_err, CacheError};
use crate::state::StateTable;

/// Entry count above which hashing a directory emits an advisory.
pub const LARGE_DIR_SIZE: usize = 100;

const BUF_SIZE: usize = 1 << 20;

/// Result of hashing a workspace path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hashed {
    File(ContentId),
    Dir(ContentId, DirObject),
}

impl Hashed {
    pub fn id(&self) -> &ContentId {
        match self {
            Hashed::File(id) | Hashed::Dir(id, _) => id,
        }
    }

    pub fn into_id(self) -> ContentId {
        match self {
            Hashed::File(id) | Hashed::Dir(id, _) => id,
        }
    }
}

/// Digest of everything `reader` yields.
pub fn digest_reader(mut reader: impl Read) -> std::io::Result<ContentId> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(ContentId(hex::encode(hasher.finalize())))
}

pub fn digest_bytes(bytes: &[u8]) -> ContentId {
    ContentId(hex::encode(Sha256::digest(bytes)))
}

/// Digest of a file's bytes, bypassing the state table.
pub fn digest_file(path: &Path) -> Result<ContentId, CacheError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    digest_reader(file).map_err(|e| io_err(path, e))
}

/// Serialized form of a directory listing.
pub fn encode_dir_object(obj: &DirObject) -> Vec<u8> {
    // A Vec of plain string structs cannot fail to serialize.
    serde_json::to_vec(obj).unwrap_or_default()
}

/// Parse a stored directory listing. Entries are re-sorted so that a
/// hand-edited listing cannot change lookup semantics.
pub fn decode_dir_object(id: &ContentId, bytes: &[u8]) -> Result<DirObject, CacheError> {
    let obj: DirObject = serde_json::from_slice(bytes).map_err(|e| CacheError::Corrupted {
        id: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(DirObject::new(obj.entries().to_vec()))
}

/// Identity of a directory listing.
pub fn dir_object_id(obj: &DirObject) -> ContentId {
    let digest = digest_bytes(&encode_dir_object(obj));
    ContentId::for_dir(digest.as_str())
}

/// Memoizing hasher bound to one repository's state table.
#[derive(Debug)]
pub struct Hasher {
    state: StateTable,
}

impl Hasher {
    pub fn new(state: StateTable) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &StateTable {
        &self.state
    }

    /// Hash a file or a directory.
    pub fn hash(&self, path: &Path) -> Result<Hashed, CacheError> {
        let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        if meta.is_dir() {
            let (id, obj) = self.hash_dir(path)?;
            Ok(Hashed::Dir(id, obj))
        } else {
            self.hash_file(path).map(Hashed::File)
        }
    }

    pub fn hash_file(&self, path: &Path) -> Result<ContentId, CacheError> {
        let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        if let Some(id) = self.state.lookup(path, &meta) {
            tracing::debug!("unchanged fingerprint: {}", path.display());
            return Ok(id);
        }
        let id = digest_file(path)?;
        self.state.record(path, &meta, &id);
        Ok(id)
    }

    /// Refresh the fingerprint for `path` without reading it, when its
    /// identity is already known.
    pub fn remember(&self, path: &Path, id: &ContentId) -> Result<bool, CacheError> {
        let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        Ok(self.state.record(path, &meta, id))
    }

    /// Hash every file below `dir` into a directory listing.
    pub fn hash_dir(&self, dir: &Path) -> Result<(ContentId, DirObject), CacheError> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).follow_links(true) {
            let entry = entry.map_err(|e| walk_err(dir, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            entries.push(DirEntry {
                checksum: self.hash_file(entry.path())?,
                relpath: paths::to_posix(relative),
            });
        }
        if entries.len() > LARGE_DIR_SIZE {
            tracing::warn!(
                "{} contains {} files; hashing large directories can take a while",
                dir.display(),
                entries.len()
            );
        }
        let obj = DirObject::new(entries);
        Ok((dir_object_id(&obj), obj))
    }

    pub fn save(&self) -> Result<(), CacheError> {
        self.state.save()
    }
}

pub(crate) fn walk_err(root: &Path, err: walkdir::Error) -> CacheError {
    let path = err
        .path()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    let source = err
        .into_io_error()
        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
    io_err(path, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hasher(tmp: &TempDir) -> Hasher {
        Hasher::new(StateTable::empty(tmp.path().join("state.json")))
    }

    #[test]
    fn identical_bytes_share_identity() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"same").unwrap();
        std::fs::write(tmp.path().join("b"), b"same").unwrap();
        let h = hasher(&tmp);
        assert_eq!(
            h.hash_file(&tmp.path().join("a")).unwrap(),
            h.hash_file(&tmp.path().join("b")).unwrap()
        );
        assert_eq!(
            h.hash_file(&tmp.path().join("a")).unwrap(),
            digest_bytes(b"same")
        );
    }

    #[test]
    fn known_sha256_digest() {
        assert_eq!(
            digest_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn dir_identity_ignores_creation_order() {
        let one = TempDir::new().unwrap();
        std::fs::create_dir_all(one.path().join("d/sub")).unwrap();
        std::fs::write(one.path().join("d/b.txt"), b"b").unwrap();
        std::fs::write(one.path().join("d/sub/a.txt"), b"a").unwrap();

        let two = TempDir::new().unwrap();
        std::fs::create_dir_all(two.path().join("d/sub")).unwrap();
        std::fs::write(two.path().join("d/sub/a.txt"), b"a").unwrap();
        std::fs::write(two.path().join("d/b.txt"), b"b").unwrap();

        let (id1, obj1) = hasher(&one).hash_dir(&one.path().join("d")).unwrap();
        let (id2, _) = hasher(&two).hash_dir(&two.path().join("d")).unwrap();
        assert_eq!(id1, id2);
        assert!(id1.is_dir());
        let relpaths: Vec<_> = obj1.entries().iter().map(|e| e.relpath.as_str()).collect();
        assert_eq!(relpaths, ["b.txt", "sub/a.txt"]);
    }

    #[test]
    fn dir_object_serializes_as_checksum_relpath_list() {
        let obj = DirObject::new(vec![DirEntry {
            checksum: ContentId::from("aa"),
            relpath: "x".into(),
        }]);
        assert_eq!(
            String::from_utf8(encode_dir_object(&obj)).unwrap(),
            r#"[{"checksum":"aa","relpath":"x"}]"#
        );
    }

    #[test]
    fn memoized_digest_is_served_from_state() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"content").unwrap();
        let h = hasher(&tmp);
        let meta = std::fs::metadata(&file).unwrap();
        // Seed a forged record: a hit proves the bytes were not re-read.
        h.state().record(&file, &meta, &ContentId::from("forged"));
        assert_eq!(h.hash_file(&file).unwrap(), ContentId::from("forged"));
    }
}
