//! The remote object-space capability and backend selection.
//!
//! Keys are the backend-agnostic object keys produced by
//! [`ContentId::object_key`] (`ab/cdef…`). Backends map them onto their own
//! namespace below the configured URL.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use url::Url;

use datum_core::ContentId;

use crate::error::{RemoteError, SyncError};
use crate::local::LocalRemote;
use crate::objectstore::ObjectStoreRemote;

/// Blocking object-store operations over one remote.
pub trait RemotePort: Send + Sync + fmt::Debug {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    /// Every key under `prefix` (empty = everything).
    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    fn get(&self, key: &str, dest: &mut dyn Write) -> Result<(), RemoteError>;

    fn put(&self, src: &mut dyn Read, key: &str) -> Result<(), RemoteError>;

    fn remove(&self, key: &str) -> Result<(), RemoteError>;
}

/// Every content identity stored on `remote`.
pub fn list_ids(remote: &dyn RemotePort) -> Result<BTreeSet<ContentId>, RemoteError> {
    Ok(remote
        .list("")?
        .iter()
        .filter_map(|key| ContentId::from_object_key(key))
        .collect())
}

/// Select a backend for `url`: plain paths and `file://` URLs use the
/// filesystem adapter (relative paths resolve against `base`); every other
/// scheme goes through `object_store` with `options` passed verbatim.
pub fn open_remote(
    url: &str,
    options: &BTreeMap<String, String>,
    base: &Path,
) -> Result<Arc<dyn RemotePort>, SyncError> {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => {
            let path = parsed.to_file_path().map_err(|()| SyncError::InvalidUrl {
                url: url.to_string(),
                message: "not a local file path".into(),
            })?;
            Ok(Arc::new(LocalRemote::new(path)))
        }
        // A single-letter scheme is a Windows drive letter.
        Ok(parsed) if parsed.scheme().len() > 1 => {
            let remote = ObjectStoreRemote::with_url(&parsed, options).map_err(|e| {
                SyncError::InvalidUrl {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            })?;
            Ok(Arc::new(remote))
        }
        _ => Ok(Arc::new(LocalRemote::new(base.join(url)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn plain_and_file_urls_open_local_remotes() {
        let tmp = TempDir::new().unwrap();
        let none = BTreeMap::new();
        let relative = open_remote("storage", &none, tmp.path()).unwrap();
        assert_eq!(
            relative.describe(),
            tmp.path().join("storage").display().to_string()
        );

        let url = Url::from_directory_path(tmp.path()).unwrap();
        let file = open_remote(url.as_str(), &none, Path::new("/unused")).unwrap();
        assert!(file.describe().starts_with(&tmp.path().display().to_string()));
    }

    #[test]
    fn memory_scheme_opens_object_store() {
        let remote = open_remote("memory:///", &BTreeMap::new(), Path::new(".")).unwrap();
        assert!(remote.describe().starts_with("memory:"));
        assert!(!remote.exists("ab/cd").unwrap());
    }
}
