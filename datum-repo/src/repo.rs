//! The repository context: one explicit object carrying the root, the
//! configuration, the cache, the fingerprint table and the interrupt flag,
//! passed to every operation instead of process-wide state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use datum_cache::{CacheStore, Hasher, StateTable};
use datum_core::config::{self, RepoConfig};
use datum_core::error::io_err;
use datum_core::lock::RepoLock;
use datum_core::lockfile::{self, LockFile};
use datum_core::{paths, ContentId, CoreError, Interrupt, Stage};
use datum_pipeline::StageGraph;

use crate::error::RepoError;

#[derive(Debug)]
pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
    cache: Arc<CacheStore>,
    hasher: Hasher,
    interrupt: Interrupt,
}

/// One recorded output, resolved to the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedOutput {
    pub stage: String,
    /// Repo-relative.
    pub path: PathBuf,
    pub id: ContentId,
    pub cache: bool,
}

impl Repo {
    /// Create the `.datum` directory at `root` and open the repository.
    pub fn init(root: &Path, force: bool) -> Result<Self, RepoError> {
        let dot = paths::dot_dir(root);
        if dot.exists() {
            if !force {
                return Err(RepoError::AlreadyInitialized {
                    path: root.to_path_buf(),
                });
            }
            tracing::warn!("reinitializing {}", dot.display());
        }
        for dir in [paths::cache_dir(root), paths::tmp_dir(root)] {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        if force || !config::path_at(root).exists() {
            config::save_at(root, &RepoConfig::default())?;
        }
        tracing::info!("initialized datum repository at {}", root.display());
        Self::open(root)
    }

    /// Open the repository rooted exactly at `root`.
    pub fn open(root: &Path) -> Result<Self, RepoError> {
        let dot = paths::dot_dir(root);
        if !dot.is_dir() {
            return Err(CoreError::NotARepository { path: dot }.into());
        }
        let config = config::load_at(root)?;
        let cache = CacheStore::at_repo(root, config.cache.link_types.clone());
        let hasher = Hasher::new(StateTable::load_at(root)?);
        Ok(Self {
            root: root.to_path_buf(),
            config,
            cache: Arc::new(cache),
            hasher,
            interrupt: Interrupt::new(),
        })
    }

    /// Open the repository containing `start` (or one of its ancestors).
    pub fn discover(start: &Path) -> Result<Self, RepoError> {
        for dir in start.ancestors() {
            if paths::dot_dir(dir).is_dir() {
                return Self::open(dir);
            }
        }
        Err(CoreError::NotARepository {
            path: paths::dot_dir(start),
        }
        .into())
    }

    /// Share an interrupt flag with long-running operations.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Re-read configuration after it was edited on disk.
    pub fn reload_config(&mut self) -> Result<(), RepoError> {
        self.config = config::load_at(&self.root)?;
        Ok(())
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Exclusive lock for the duration of a mutating operation.
    pub(crate) fn lock(&self) -> Result<RepoLock, RepoError> {
        Ok(RepoLock::acquire(&self.root)?)
    }

    pub fn graph(&self) -> Result<StageGraph, RepoError> {
        Ok(datum_pipeline::load_graph_at(&self.root)?)
    }

    pub(crate) fn lock_file(&self) -> Result<LockFile, RepoError> {
        Ok(lockfile::load_at(&self.root)?)
    }

    // -----------------------------------------------------------------------
    // Paths and targets
    // -----------------------------------------------------------------------

    /// Repo-relative, normalized form of `path` (absolute or relative to the
    /// root).
    pub fn relative(&self, path: &Path) -> Result<PathBuf, RepoError> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| RepoError::OutsideRepository {
                    path: path.to_path_buf(),
                })?
                .to_path_buf()
        } else {
            path.to_path_buf()
        };
        let normalized = paths::normalize(&relative);
        if normalized.starts_with("..") {
            return Err(RepoError::OutsideRepository {
                path: path.to_path_buf(),
            });
        }
        Ok(normalized)
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Every output with a recorded identity: tracking records carry theirs,
    /// pipeline outputs take theirs from the lock file.
    pub fn recorded_outputs(&self) -> Result<Vec<TrackedOutput>, RepoError> {
        let graph = self.graph()?;
        let lock = self.lock_file()?;
        let mut outputs = Vec::new();
        for stage in graph.stages() {
            for out in &stage.outs {
                let id = if stage.is_tracking() {
                    out.checksum.clone()
                } else {
                    lock.get(&stage.name)
                        .and_then(|record| record.out_checksum(&out.path))
                        .cloned()
                };
                let Some(id) = id else {
                    tracing::debug!("{}: no recorded version of {}", stage.name, out.path.display());
                    continue;
                };
                outputs.push(TrackedOutput {
                    stage: stage.name.clone(),
                    path: stage.resolve(&out.path),
                    id,
                    cache: out.cache,
                });
            }
        }
        Ok(outputs)
    }

    /// Recorded outputs selected by `targets`: stage names, tracking record
    /// paths, output paths, directories containing outputs, or paths inside a
    /// directory output. No targets selects everything.
    pub fn select_outputs(&self, targets: &[String]) -> Result<Vec<TrackedOutput>, RepoError> {
        let all = self.recorded_outputs()?;
        if targets.is_empty() {
            return Ok(all);
        }
        let mut selected: Vec<TrackedOutput> = Vec::new();
        for target in targets {
            let path = self.relative(Path::new(target))?;
            let matches: Vec<&TrackedOutput> = all
                .iter()
                .filter(|out| {
                    out.stage == *target
                        || Path::new(&out.stage) == path
                        || out.path == path
                        || paths::is_strict_ancestor(&path, &out.path)
                        || paths::is_strict_ancestor(&out.path, &path)
                        || path.as_os_str().is_empty()
                })
                .collect();
            if matches.is_empty() {
                return Err(RepoError::UnknownTarget {
                    target: target.clone(),
                });
            }
            for out in matches {
                if !selected.contains(out) {
                    selected.push(out.clone());
                }
            }
        }
        Ok(selected)
    }

    /// The stage named `name`, from the pipeline or a tracking record path.
    pub(crate) fn find_stage(&self, name: &str) -> Result<Stage, RepoError> {
        let graph = self.graph()?;
        if let Some(stage) = graph.get(name) {
            return Ok(stage.clone());
        }
        let as_path = paths::to_posix(&self.relative(Path::new(name))?);
        graph
            .get(&as_path)
            .cloned()
            .ok_or_else(|| RepoError::UnknownTarget {
                target: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_then_discover_from_subdirectory() {
        let tmp = TempDir::new().unwrap();
        Repo::init(tmp.path(), false).unwrap();
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let repo = Repo::discover(&nested).unwrap();
        assert_eq!(repo.root(), tmp.path());
        assert!(matches!(
            Repo::init(tmp.path(), false),
            Err(RepoError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn open_outside_a_repository_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            Repo::open(tmp.path()),
            Err(RepoError::Core(CoreError::NotARepository { .. }))
        ));
    }

    #[test]
    fn relative_paths_stay_inside_the_root() {
        let tmp = TempDir::new().unwrap();
        let repo = Repo::init(tmp.path(), false).unwrap();
        assert_eq!(
            repo.relative(&tmp.path().join("data/./x")).unwrap(),
            PathBuf::from("data/x")
        );
        assert!(matches!(
            repo.relative(Path::new("../elsewhere")),
            Err(RepoError::OutsideRepository { .. })
        ));
    }
}
