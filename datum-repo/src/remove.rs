//! `remove` and `unprotect`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use datum_cache::unprotect;
use datum_core::error::io_err;
use datum_core::{lockfile, pipeline_file, StageKind};

use crate::error::RepoError;
use crate::repo::Repo;

impl Repo {
    /// Stop tracking `target` (a tracking record or a pipeline stage name).
    /// With `remove_outs` the workspace outputs are deleted; otherwise they
    /// are left in place as independent writable files. Returns the output
    /// paths (repo-relative).
    pub fn remove(&self, target: &str, remove_outs: bool) -> Result<Vec<PathBuf>, RepoError> {
        let _lock = self.lock()?;
        let stage = self.find_stage(target)?;
        match &stage.kind {
            StageKind::Tracking { record } => {
                let path = self.absolute(record);
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            }
            StageKind::Pipeline => {
                pipeline_file::remove_at(self.root(), &stage.name)?;
                lockfile::remove_at(self.root(), &stage.name)?;
            }
        }

        let outs = stage.out_paths();
        for out in &outs {
            let path = self.absolute(out);
            if remove_outs {
                remove_path(&path)?;
                tracing::info!("removed {}", out.display());
            } else if path.exists() {
                unprotect(&path)?;
            }
            self.hasher().state().forget(&path);
        }
        self.hasher().save()?;
        tracing::info!("stopped tracking '{}'", stage.name);
        Ok(outs)
    }

    /// Make tracked workspace paths safe to edit in place.
    pub fn unprotect(&self, targets: &[PathBuf]) -> Result<(), RepoError> {
        let _lock = self.lock()?;
        for target in targets {
            let relative = self.relative(target)?;
            let path = self.absolute(&relative);
            if std::fs::symlink_metadata(&path).is_err() {
                return Err(RepoError::PathNotFound { path: relative });
            }
            unprotect(&path)?;
            tracing::info!("unprotected {}", relative.display());
        }
        Ok(())
    }
}

fn remove_path(path: &Path) -> Result<(), RepoError> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };
    result.map_err(|e| io_err(path, e).into())
}
