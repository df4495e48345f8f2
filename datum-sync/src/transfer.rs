//! Bulk, parallel, retrying transfers between the local cache and a remote.
//!
//! Each bulk operation builds a multi-thread tokio runtime, dispatches one
//! blocking remote call per object with `spawn_blocking`, and bounds the
//! number in flight with a semaphore of `jobs` permits. Transient failures
//! are retried with exponential backoff; everything else is recorded and the
//! operation moves on. Nothing already transferred is rolled back.
//!
//! Ordering:
//! - push uploads blobs first, then directory objects whose entries all
//!   made it (a directory object on the remote implies its entries);
//! - fetch downloads directory objects first, then the entries they list;
//!   entries of an unavailable directory object are not attempted.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use datum_cache::hasher::digest_file;
use datum_cache::{CacheError, CacheStore};
use datum_core::{ContentId, Interrupt};

use crate::error::{SyncError, TransferError};
use crate::remote::RemotePort;
use crate::status::remote_presence;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per object, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub jobs: usize,
    pub retry: RetryPolicy,
    pub interrupt: Interrupt,
}

impl TransferOptions {
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs: jobs.max(1),
            retry: RetryPolicy::default(),
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Aggregate outcome of a bulk transfer.
#[derive(Debug, Default)]
pub struct TransferSummary {
    pub succeeded: usize,
    pub failed: Vec<(ContentId, TransferError)>,
    /// Never dispatched because of an interrupt.
    pub cancelled: Vec<ContentId>,
    /// Already present at the destination; nothing to do.
    pub up_to_date: usize,
}

impl TransferSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn failed_ids(&self) -> BTreeSet<ContentId> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }

    fn absorb(&mut self, phase: PhaseOutcome) {
        self.succeeded += phase.succeeded.len();
        self.failed.extend(phase.failed);
        self.cancelled.extend(phase.cancelled);
    }

    fn finish(mut self) -> Self {
        self.failed.sort_by(|a, b| a.0.cmp(&b.0));
        self.cancelled.sort();
        self
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Upload `ids` (directory objects expanded to their entries) that the
/// remote does not have yet.
pub fn push(
    cache: &Arc<CacheStore>,
    remote: &Arc<dyn RemotePort>,
    ids: &BTreeSet<ContentId>,
    opts: &TransferOptions,
) -> Result<TransferSummary, SyncError> {
    let mut summary = TransferSummary::default();
    let mut blobs = BTreeSet::new();
    let mut dirs = Vec::new();
    for id in ids {
        if !id.is_dir() {
            blobs.insert(id.clone());
            continue;
        }
        match cache.load_dir_object(id) {
            Ok(obj) => {
                let entries: Vec<ContentId> =
                    obj.entries().iter().map(|e| e.checksum.clone()).collect();
                blobs.extend(entries.iter().cloned());
                dirs.push((id.clone(), entries));
            }
            Err(err) => summary.failed.push((id.clone(), err.into())),
        }
    }

    let mut candidates = blobs.clone();
    candidates.extend(dirs.iter().map(|(id, _)| id.clone()));
    let runtime = build_runtime(opts.jobs)?;
    // An id whose existence check failed is treated as absent; the upload decides.
    let presence = remote_presence(&runtime, remote, &candidates, opts);
    for (id, err) in &presence.unknown {
        tracing::warn!("{id}: presence unknown ({err}); uploading anyway");
    }
    let present = presence.present;

    let pending: Vec<ContentId> = blobs.difference(&present).cloned().collect();
    summary.up_to_date += blobs.len() - pending.len();
    tracing::info!(
        "pushing {} object(s) to {}",
        pending.len(),
        remote.describe()
    );

    let upload = {
        let cache = Arc::clone(cache);
        let remote = Arc::clone(remote);
        move |id: &ContentId| upload_one(&cache, remote.as_ref(), id)
    };
    let blob_phase = run_phase(&runtime, pending, opts, upload.clone());
    let failed: BTreeSet<ContentId> = blob_phase.failed.iter().map(|(id, _)| id.clone()).collect();
    let cancelled: BTreeSet<ContentId> = blob_phase.cancelled.iter().cloned().collect();
    summary.absorb(blob_phase);

    let mut ready = Vec::new();
    for (dir, entries) in dirs {
        if present.contains(&dir) {
            summary.up_to_date += 1;
            continue;
        }
        let missing = entries.iter().filter(|e| failed.contains(*e)).count();
        if missing > 0 {
            summary
                .failed
                .push((dir.clone(), TransferError::IncompleteDirectory { id: dir, missing }));
        } else if entries.iter().any(|e| cancelled.contains(e)) {
            summary.cancelled.push(dir);
        } else {
            ready.push(dir);
        }
    }
    summary.absorb(run_phase(&runtime, ready, opts, upload));
    Ok(summary.finish())
}

fn upload_one(
    cache: &CacheStore,
    remote: &dyn RemotePort,
    id: &ContentId,
) -> Result<(), TransferError> {
    let path = cache.path_for(id);
    let mut file = match std::fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CacheError::NotFound { id: id.clone() }.into())
        }
        Err(source) => return Err(CacheError::Io { path, source }.into()),
    };
    remote.put(&mut file, &id.object_key())?;
    tracing::info!("uploaded {id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Download `ids` missing from the local cache. Downloads are verified
/// against their identity before they become visible in the cache.
pub fn fetch(
    cache: &Arc<CacheStore>,
    remote: &Arc<dyn RemotePort>,
    ids: &BTreeSet<ContentId>,
    opts: &TransferOptions,
) -> Result<TransferSummary, SyncError> {
    let mut summary = TransferSummary::default();
    let runtime = build_runtime(opts.jobs)?;
    let download = {
        let cache = Arc::clone(cache);
        let remote = Arc::clone(remote);
        move |id: &ContentId| download_one(&cache, remote.as_ref(), id)
    };

    let dir_ids: Vec<ContentId> = ids.iter().filter(|id| id.is_dir()).cloned().collect();
    let missing_dirs: Vec<ContentId> = dir_ids.iter().filter(|d| !cache.has(d)).cloned().collect();
    summary.up_to_date += dir_ids.len() - missing_dirs.len();
    let dir_phase = run_phase(&runtime, missing_dirs, opts, download.clone());
    let mut unavailable: BTreeSet<ContentId> =
        dir_phase.failed.iter().map(|(id, _)| id.clone()).collect();
    unavailable.extend(dir_phase.cancelled.iter().cloned());
    summary.absorb(dir_phase);

    let mut blobs: BTreeSet<ContentId> = ids.iter().filter(|id| !id.is_dir()).cloned().collect();
    for dir in dir_ids.iter().filter(|d| !unavailable.contains(*d)) {
        match cache.load_dir_object(dir) {
            Ok(obj) => blobs.extend(obj.entries().iter().map(|e| e.checksum.clone())),
            Err(err) => summary.failed.push((dir.clone(), err.into())),
        }
    }

    let pending: Vec<ContentId> = blobs.iter().filter(|b| !cache.has(b)).cloned().collect();
    summary.up_to_date += blobs.len() - pending.len();
    tracing::info!(
        "fetching {} object(s) from {}",
        pending.len(),
        remote.describe()
    );
    summary.absorb(run_phase(&runtime, pending, opts, download));
    Ok(summary.finish())
}

fn download_one(
    cache: &CacheStore,
    remote: &dyn RemotePort,
    id: &ContentId,
) -> Result<(), TransferError> {
    if cache.has(id) {
        return Ok(());
    }
    let mut pending = cache.begin(id)?;
    remote.get(&id.object_key(), pending.file())?;
    let digest = digest_file(pending.tmp_path())?;
    let actual = if id.is_dir() {
        ContentId::for_dir(digest.as_str())
    } else {
        digest
    };
    if &actual != id {
        return Err(TransferError::ChecksumMismatch {
            id: id.clone(),
            actual,
        });
    }
    pending.commit()?;
    tracing::info!("downloaded {id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Per-object results of one pool run.
#[derive(Debug)]
pub(crate) struct PhaseOutcome<T = ()> {
    pub(crate) succeeded: Vec<(ContentId, T)>,
    pub(crate) failed: Vec<(ContentId, TransferError)>,
    pub(crate) cancelled: Vec<ContentId>,
}

impl<T> Default for PhaseOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

pub(crate) fn build_runtime(jobs: usize) -> Result<Runtime, SyncError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(jobs.max(1))
        .thread_name("datum-transfer")
        .enable_time()
        .build()
        .map_err(SyncError::Runtime)
}

/// Run `op` once per item on the pool, `opts.jobs` at a time, retrying
/// transient failures.
pub(crate) fn run_phase<T, F>(
    runtime: &Runtime,
    items: Vec<ContentId>,
    opts: &TransferOptions,
    op: F,
) -> PhaseOutcome<T>
where
    T: Send + 'static,
    F: Fn(&ContentId) -> Result<T, TransferError> + Send + Sync + 'static,
{
    if items.is_empty() {
        return PhaseOutcome::default();
    }
    let op = Arc::new(op);
    runtime.block_on(async {
        let semaphore = Arc::new(Semaphore::new(opts.jobs.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcome = PhaseOutcome::default();

        for id in items {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                outcome.cancelled.push(id);
                continue;
            };
            if opts.interrupt.is_triggered() {
                outcome.cancelled.push(id);
                continue;
            }
            let op = Arc::clone(&op);
            let retry = opts.retry;
            tasks.spawn(async move {
                let _permit = permit;
                let job_id = id.clone();
                let result = with_retry(retry, id.as_str(), Arc::new(move || op(&job_id))).await;
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(value))) => outcome.succeeded.push((id, value)),
                Ok((id, Err(err))) => {
                    tracing::error!("{id}: {err}");
                    outcome.failed.push((id, err));
                }
                Err(err) => tracing::error!("transfer task aborted: {err}"),
            }
        }
        if !outcome.cancelled.is_empty() {
            tracing::warn!(
                "interrupted; {} object(s) not transferred",
                outcome.cancelled.len()
            );
        }
        outcome
    })
}

/// Run the blocking `op` until it succeeds, fails permanently or runs out of
/// attempts. `label` names the work in logs.
pub(crate) async fn with_retry<T, F>(
    policy: RetryPolicy,
    label: &str,
    op: Arc<F>,
) -> Result<T, TransferError>
where
    T: Send + 'static,
    F: Fn() -> Result<T, TransferError> + Send + Sync + 'static,
{
    let mut attempt = 1;
    loop {
        let job = Arc::clone(&op);
        let result = match tokio::task::spawn_blocking(move || job()).await {
            Ok(result) => result,
            Err(err) => Err(TransferError::Worker(err.to_string())),
        };
        match result {
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    "{label}: {err}; retrying in {delay:?} (attempt {attempt}/{})",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn summary_success_requires_no_failures_or_cancellations() {
        let mut summary = TransferSummary {
            succeeded: 3,
            ..Default::default()
        };
        assert!(summary.is_success());
        summary.cancelled.push(ContentId::from("aa"));
        assert!(!summary.is_success());
    }
}
