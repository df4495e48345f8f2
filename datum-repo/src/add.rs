//! `add`: put workspace paths under content tracking.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use datum_cache::{commit, LARGE_DIR_SIZE};
use datum_core::error::io_err;
use datum_core::tracking::{self, TrackingRecord};
use datum_core::{paths, Stage};
use datum_pipeline::StageGraph;

use crate::error::RepoError;
use crate::repo::Repo;

impl Repo {
    /// Track each of `targets` with its own `*.datum` record. With
    /// `recursive`, every file below a directory target is tracked
    /// separately instead of the directory as a whole.
    pub fn add(&self, targets: &[PathBuf], recursive: bool) -> Result<Vec<Stage>, RepoError> {
        let _lock = self.lock()?;

        let mut files = Vec::new();
        for target in targets {
            let relative = self.relative(target)?;
            let absolute = self.absolute(&relative);
            if std::fs::symlink_metadata(&absolute).is_err() {
                return Err(RepoError::PathNotFound { path: relative });
            }
            if recursive && absolute.is_dir() {
                let expanded = self.expand_dir(&relative)?;
                if expanded.len() > LARGE_DIR_SIZE {
                    tracing::warn!(
                        "adding {} files from {} one by one; consider tracking the directory as a whole",
                        expanded.len(),
                        relative.display()
                    );
                }
                files.extend(expanded);
            } else {
                files.push(relative);
            }
        }

        self.check_addable(&files)?;

        let mut stages = Vec::with_capacity(files.len());
        for relative in files {
            let committed = commit(self.cache(), self.hasher(), &self.absolute(&relative))?;
            let record_rel = tracking::record_path_for(&relative);
            let name = relative.file_name().map(PathBuf::from).unwrap_or_default();
            let record = TrackingRecord::single(name, committed.id.clone());
            tracking::save(&self.absolute(&record_rel), &record)?;
            tracing::info!("added {} ({})", relative.display(), committed.id);
            stages.push(record.to_stage(&record_rel));
        }
        self.hasher().save()?;
        Ok(stages)
    }

    /// Files below `dir` (repo-relative), skipping tracking records and the
    /// `.datum` directory.
    fn expand_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, RepoError> {
        let mut files = Vec::new();
        let walker = WalkDir::new(self.absolute(dir))
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != paths::DOT_DIR);
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                io_err(path, std::io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(paths::TRACKING_SUFFIX) {
                continue;
            }
            files.push(self.relative(entry.path())?);
        }
        Ok(files)
    }

    /// Reject targets that a pipeline stage produces, and validate that the
    /// new records keep the graph well formed, before anything is written.
    fn check_addable(&self, files: &[PathBuf]) -> Result<(), RepoError> {
        let graph = self.graph()?;
        let mut candidates: Vec<Stage> = Vec::new();
        for relative in files {
            if relative.starts_with(paths::DOT_DIR) {
                return Err(RepoError::OutsideRepository {
                    path: relative.clone(),
                });
            }
            if let Some(owner) = graph.owner_of(relative) {
                if !owner.is_tracking() {
                    return Err(RepoError::StageOutput {
                        path: relative.clone(),
                        stage: owner.name.clone(),
                    });
                }
            }
            let record_rel = tracking::record_path_for(relative);
            let name = relative.file_name().map(PathBuf::from).unwrap_or_default();
            let candidate = TrackingRecord {
                outs: vec![tracking::TrackedOut {
                    checksum: None,
                    path: name,
                }],
            };
            candidates.push(candidate.to_stage(&record_rel));
        }

        // Re-adding a path replaces its record.
        let mut stages: Vec<Stage> = graph
            .stages()
            .iter()
            .filter(|s| !candidates.iter().any(|c| c.name == s.name))
            .cloned()
            .collect();
        stages.extend(candidates);
        StageGraph::build(stages)?;
        Ok(())
    }
}
