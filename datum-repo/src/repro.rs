//! `repro`: re-run stale pipeline stages.

use datum_pipeline::{Executor, ExecutorOptions, ExecutorResult};

use crate::error::RepoError;
use crate::repo::Repo;

impl Repo {
    /// Run the named stages and everything upstream of them (the whole
    /// pipeline when `targets` is empty), skipping up-to-date stages unless
    /// `force` is set.
    pub fn repro(&self, targets: &[String], force: bool) -> Result<ExecutorResult, RepoError> {
        let _lock = self.lock()?;
        let graph = self.graph()?;
        let selected = graph.select(targets)?;
        let opts = ExecutorOptions {
            force,
            interrupt: self.interrupt().clone(),
        };
        let result = Executor::new(self.root(), self.cache(), self.hasher(), opts).run(&graph, &selected)?;
        tracing::info!(
            "{} ran, {} up to date, {} failed, {} blocked",
            result.ran.len(),
            result.skipped.len(),
            result.failed.len(),
            result.blocked.len()
        );
        if result.is_success() {
            Ok(result)
        } else {
            Err(RepoError::ReproFailed(Box::new(result)))
        }
    }
}
