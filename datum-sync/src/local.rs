//! Filesystem-backed remote: a plain directory with the cache layout.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::RemoteError;
use crate::remote::RemotePort;

#[derive(Debug, Clone)]
pub struct LocalRemote {
    root: PathBuf,
}

impl LocalRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl RemotePort for LocalRemote {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        match std::fs::metadata(self.path(key)) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(RemoteError::from_io(key, &err)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| {
                let err = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                RemoteError::from_io(prefix, &err)
            })?;
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with(".tmp") {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str, dest: &mut dyn Write) -> Result<(), RemoteError> {
        let mut file = std::fs::File::open(self.path(key)).map_err(|e| RemoteError::from_io(key, &e))?;
        std::io::copy(&mut file, dest).map_err(|e| RemoteError::from_io(key, &e))?;
        Ok(())
    }

    fn put(&self, src: &mut dyn Read, key: &str) -> Result<(), RemoteError> {
        let dest = self.path(key);
        let parent = dest.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent).map_err(|e| RemoteError::from_io(key, &e))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| RemoteError::from_io(key, &e))?;
        std::io::copy(src, tmp.as_file_mut()).map_err(|e| RemoteError::from_io(key, &e))?;
        tmp.persist(&dest)
            .map_err(|e| RemoteError::from_io(key, &e.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RemoteError> {
        std::fs::remove_file(self.path(key)).map_err(|e| RemoteError::from_io(key, &e))
    }
}
