//! `gc`: drop cache entries nothing references.

use std::collections::BTreeSet;

use datum_cache::GcReport;
use datum_core::ContentId;

use crate::error::RepoError;
use crate::repo::Repo;

impl Repo {
    /// Remove every cache entry not referenced by a recorded output of the
    /// workspace or listed in `keep`. Directory objects keep their entries.
    pub fn gc(&self, keep: &BTreeSet<ContentId>) -> Result<GcReport, RepoError> {
        let _lock = self.lock()?;
        let mut live: BTreeSet<ContentId> = keep.clone();
        live.extend(self.recorded_outputs()?.into_iter().map(|o| o.id));
        let live = self.cache().expand(&live)?;
        let report = self.cache().collect_garbage(&live)?;
        tracing::info!(
            "removed {} cache entr{}, kept {}",
            report.removed.len(),
            if report.removed.len() == 1 { "y" } else { "ies" },
            report.kept
        );
        Ok(report)
    }
}
