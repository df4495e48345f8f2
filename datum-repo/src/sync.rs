//! Workspace checkout and remote transfers.

use std::collections::BTreeSet;
use std::sync::Arc;

use datum_core::ContentId;
use datum_sync::{
    CheckoutOptions, CheckoutReport, CheckoutTarget, RemotePort, TransferOptions, TransferSummary,
};

use crate::error::RepoError;
use crate::repo::{Repo, TrackedOutput};

/// Transfer parameters shared by push, pull and fetch.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub targets: Vec<String>,
    /// Parallel transfers; the configured value when unset.
    pub jobs: Option<usize>,
    /// Remote name; the default remote when unset.
    pub remote: Option<String>,
}

impl Repo {
    /// Restore the recorded version of the selected outputs.
    pub fn checkout(
        &self,
        targets: &[String],
        opts: CheckoutOptions,
    ) -> Result<CheckoutReport, RepoError> {
        let _lock = self.lock()?;
        let outputs = self.select_outputs(targets)?;
        let report = self.checkout_outputs(&outputs, opts)?;
        if report.is_success() {
            Ok(report)
        } else {
            Err(RepoError::CheckoutFailed(Box::new(report)))
        }
    }

    /// Check out `outputs`, collecting per-path failures in the report.
    fn checkout_outputs(
        &self,
        outputs: &[TrackedOutput],
        opts: CheckoutOptions,
    ) -> Result<CheckoutReport, RepoError> {
        let targets: Vec<CheckoutTarget> = outputs
            .iter()
            .filter(|out| out.cache)
            .map(|out| CheckoutTarget {
                path: self.absolute(&out.path),
                id: out.id.clone(),
            })
            .collect();
        let report = datum_sync::checkout(self.cache(), self.hasher(), &targets, opts);
        self.hasher().save()?;
        Ok(report)
    }

    /// Upload the selected outputs' objects.
    pub fn push(&self, request: &SyncRequest) -> Result<TransferSummary, RepoError> {
        let ids = self.cached_ids(&request.targets)?;
        let remote = self.open_remote(request.remote.as_deref())?;
        let summary = datum_sync::push(self.cache(), &remote, &ids, &self.transfer_options(request))?;
        finish(summary)
    }

    /// Download the selected outputs' objects into the cache.
    pub fn fetch(&self, request: &SyncRequest) -> Result<TransferSummary, RepoError> {
        let _lock = self.lock()?;
        let ids = self.cached_ids(&request.targets)?;
        let remote = self.open_remote(request.remote.as_deref())?;
        let summary =
            datum_sync::fetch(self.cache(), &remote, &ids, &self.transfer_options(request))?;
        finish(summary)
    }

    /// Fetch, then check out whatever was fetched. Outputs whose objects
    /// failed to download are left alone. When either half fails the error
    /// carries both the transfer summary and the checkout report.
    pub fn pull(
        &self,
        request: &SyncRequest,
        opts: CheckoutOptions,
    ) -> Result<(TransferSummary, CheckoutReport), RepoError> {
        let _lock = self.lock()?;
        let outputs = self.select_outputs(&request.targets)?;
        let ids: BTreeSet<ContentId> = outputs
            .iter()
            .filter(|o| o.cache)
            .map(|o| o.id.clone())
            .collect();
        let remote = self.open_remote(request.remote.as_deref())?;
        let summary =
            datum_sync::fetch(self.cache(), &remote, &ids, &self.transfer_options(request))?;
        let failed = summary.failed_ids();
        let ready: Vec<TrackedOutput> = outputs
            .into_iter()
            .filter(|o| !failed.contains(&o.id) && !summary.cancelled.contains(&o.id))
            .collect();
        let report = self.checkout_outputs(&ready, opts)?;
        tracing::info!(
            "{} transferred, {} up to date, {} failed; {} path(s) failed to check out",
            summary.succeeded,
            summary.up_to_date,
            summary.failed.len(),
            report.failed.len()
        );
        if summary.is_success() && report.is_success() {
            Ok((summary, report))
        } else {
            Err(RepoError::PullFailed {
                transfer: Box::new(summary),
                checkout: Box::new(report),
            })
        }
    }

    pub(crate) fn open_remote(&self, name: Option<&str>) -> Result<Arc<dyn RemotePort>, RepoError> {
        let (name, remote) = self.config().resolve_remote(name)?;
        tracing::debug!("using remote '{name}' at {}", remote.url);
        Ok(datum_sync::open_remote(
            &remote.url,
            &remote.options,
            self.root(),
        )?)
    }

    pub(crate) fn cached_ids(&self, targets: &[String]) -> Result<BTreeSet<ContentId>, RepoError> {
        Ok(self
            .select_outputs(targets)?
            .into_iter()
            .filter(|o| o.cache)
            .map(|o| o.id)
            .collect())
    }

    pub(crate) fn transfer_options(&self, request: &SyncRequest) -> TransferOptions {
        TransferOptions::new(request.jobs.unwrap_or_else(|| self.config().jobs()))
            .with_interrupt(self.interrupt().clone())
    }
}

fn finish(summary: TransferSummary) -> Result<TransferSummary, RepoError> {
    tracing::info!(
        "{} transferred, {} up to date, {} failed",
        summary.succeeded,
        summary.up_to_date,
        summary.failed.len()
    );
    if summary.is_success() {
        Ok(summary)
    } else {
        Err(RepoError::TransferFailed(Box::new(summary)))
    }
}
