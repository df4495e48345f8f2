//! `status`: pipeline staleness, modified tracked data and, optionally, the
//! object status against a remote.

use datum_pipeline::{Checker, StageStatus};
use datum_sync::SyncStatus;

use crate::error::RepoError;
use crate::repo::Repo;
use crate::sync::SyncRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub tracking: bool,
    pub status: StageStatus,
}

#[derive(Debug, Default)]
pub struct StatusReport {
    /// Every selected stage, in execution order.
    pub stages: Vec<StageReport>,
    /// Three-way object status, when a remote was requested.
    pub remote: Option<SyncStatus>,
}

impl StatusReport {
    pub fn stale(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.status.is_stale())
    }

    pub fn is_clean(&self) -> bool {
        self.stale().next().is_none() && self.remote.as_ref().map_or(true, SyncStatus::is_clean)
    }
}

impl Repo {
    /// Report without changing anything on disk. `remote` is a remote name;
    /// `Some("")` selects the default remote.
    pub fn status(&self, targets: &[String], remote: Option<&str>) -> Result<StatusReport, RepoError> {
        let graph = self.graph()?;
        let lock = self.lock_file()?;
        let checker = Checker::new(self.root(), self.cache(), self.hasher());
        let mut selected = std::collections::BTreeSet::new();
        for target in targets {
            let stage = self.find_stage(target)?;
            if let Some(index) = graph.index_of(&stage.name) {
                selected.insert(index);
            }
        }

        let mut report = StatusReport::default();
        for &index in graph.order() {
            if !selected.is_empty() && !selected.contains(&index) {
                continue;
            }
            let stage = graph.stage(index);
            report.stages.push(StageReport {
                name: stage.name.clone(),
                tracking: stage.is_tracking(),
                status: checker.check(stage, lock.get(&stage.name))?,
            });
        }

        if let Some(name) = remote {
            let name = Some(name).filter(|n| !n.is_empty());
            let remote = self.open_remote(name)?;
            let ids = self.cached_ids(targets)?;
            let opts = self.transfer_options(&SyncRequest::default());
            report.remote = Some(datum_sync::status(self.cache(), &remote, &ids, &opts)?);
        }
        Ok(report)
    }
}
