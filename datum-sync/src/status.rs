//! Three-way object status: local cache versus remote.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::runtime::Runtime;

use datum_cache::{CacheError, CacheStore};
use datum_core::{ContentId, DirObject};

use crate::error::{RemoteError, SyncError, TransferError};
use crate::remote::{self, RemotePort};
use crate::transfer::{build_runtime, run_phase, with_retry, RetryPolicy, TransferOptions};

/// Above this many ids a single remote listing is cheaper than one
/// existence check per object.
const LIST_THRESHOLD: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Not in the local cache. An id missing everywhere is in both sets.
    pub missing_local: BTreeSet<ContentId>,
    pub missing_remote: BTreeSet<ContentId>,
    pub in_sync: BTreeSet<ContentId>,
    /// Remote side undetermined after retries, with the last error.
    pub unknown: BTreeMap<ContentId, String>,
}

impl SyncStatus {
    pub fn is_clean(&self) -> bool {
        self.missing_local.is_empty() && self.missing_remote.is_empty() && self.unknown.is_empty()
    }
}

/// Classify `ids`, including every entry of the directory objects among them.
/// Nothing is written locally or remotely. Remote calls are retried like
/// transfers; an object the remote cannot be asked about lands in
/// [`SyncStatus::unknown`] instead of failing the whole report.
pub fn status(
    cache: &CacheStore,
    remote: &Arc<dyn RemotePort>,
    ids: &BTreeSet<ContentId>,
    opts: &TransferOptions,
) -> Result<SyncStatus, SyncError> {
    let runtime = build_runtime(opts.jobs)?;
    let mut report = SyncStatus::default();

    let mut all = ids.clone();
    for id in ids.iter().filter(|id| id.is_dir()) {
        match dir_listing(&runtime, cache, remote, id, opts.retry) {
            Ok(Some(obj)) => all.extend(obj.entries().iter().map(|e| e.checksum.clone())),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("{id}: cannot list directory: {err}");
                report.unknown.insert(id.clone(), err.to_string());
            }
        }
    }

    let presence = remote_presence(&runtime, remote, &all, opts);
    if !presence.cancelled.is_empty() {
        return Err(SyncError::Interrupted);
    }
    for (id, err) in presence.unknown {
        report.unknown.entry(id).or_insert_with(|| err.to_string());
    }

    for id in all {
        let local = cache.has(&id);
        if !local {
            report.missing_local.insert(id.clone());
        }
        if report.unknown.contains_key(&id) {
            continue;
        }
        if !presence.present.contains(&id) {
            report.missing_remote.insert(id.clone());
        } else if local {
            report.in_sync.insert(id);
        }
    }
    Ok(report)
}

/// Which of a set of ids the remote holds.
#[derive(Debug, Default)]
pub(crate) struct Presence {
    pub(crate) present: BTreeSet<ContentId>,
    /// Checks that kept failing.
    pub(crate) unknown: Vec<(ContentId, TransferError)>,
    /// Never checked because of an interrupt.
    pub(crate) cancelled: Vec<ContentId>,
}

/// Ask the remote which of `ids` it holds: one listing for large sets,
/// otherwise one existence check per object on the transfer pool. A failed
/// listing falls back to per-object checks.
pub(crate) fn remote_presence(
    runtime: &Runtime,
    remote: &Arc<dyn RemotePort>,
    ids: &BTreeSet<ContentId>,
    opts: &TransferOptions,
) -> Presence {
    if ids.len() > LIST_THRESHOLD {
        let lister = Arc::clone(remote);
        let listing = runtime.block_on(with_retry(
            opts.retry,
            "listing",
            Arc::new(move || -> Result<BTreeSet<ContentId>, TransferError> {
                Ok(remote::list_ids(lister.as_ref())?)
            }),
        ));
        match listing {
            Ok(listed) => {
                return Presence {
                    present: ids.intersection(&listed).cloned().collect(),
                    ..Presence::default()
                }
            }
            Err(err) => tracing::warn!(
                "listing {} failed ({err}); checking objects one by one",
                remote.describe()
            ),
        }
    }

    let check = {
        let remote = Arc::clone(remote);
        move |id: &ContentId| -> Result<bool, TransferError> {
            Ok(remote.exists(&id.object_key())?)
        }
    };
    let phase = run_phase(runtime, ids.iter().cloned().collect(), opts, check);
    Presence {
        present: phase
            .succeeded
            .into_iter()
            .filter_map(|(id, exists)| exists.then_some(id))
            .collect(),
        unknown: phase.failed,
        cancelled: phase.cancelled,
    }
}

/// Directory listing for `id`, from the cache or else read from the remote
/// without committing it. `None` when neither side has it.
fn dir_listing(
    runtime: &Runtime,
    cache: &CacheStore,
    remote: &Arc<dyn RemotePort>,
    id: &ContentId,
    retry: RetryPolicy,
) -> Result<Option<DirObject>, TransferError> {
    match cache.load_dir_object(id) {
        Ok(obj) => return Ok(Some(obj)),
        Err(CacheError::NotFound { .. }) => {}
        Err(err) => return Err(err.into()),
    }
    let reader = Arc::clone(remote);
    let key = id.object_key();
    let fetched = runtime.block_on(with_retry(
        retry,
        id.as_str(),
        Arc::new(move || -> Result<Option<Vec<u8>>, TransferError> {
            let mut buf = Vec::new();
            match reader.get(&key, &mut buf) {
                Ok(()) => Ok(Some(buf)),
                Err(RemoteError::NotFound { .. }) => Ok(None),
                Err(err) => Err(err.into()),
            }
        }),
    ))?;
    match fetched {
        Some(bytes) => Ok(Some(datum_cache::hasher::decode_dir_object(id, &bytes)?)),
        None => Ok(None),
    }
}
