//! Remote backed by an [`object_store`] compatible service (S3, GCS, Azure,
//! HTTP, in-memory).
//!
//! `object_store` is async; every call is driven to completion on a small
//! runtime owned by the remote so the port stays blocking for its callers.
//! Objects move in bounded chunks: downloads are streamed and anything
//! larger than one part is uploaded as a multipart upload.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::client::{HttpError, HttpErrorKind};
use object_store::path::Path as StorePath;
use object_store::{parse_url_opts, ObjectStore, WriteMultipart};
use tokio::runtime::Runtime;
use url::Url;

use crate::error::RemoteError;
use crate::remote::RemotePort;

/// Multipart part size. S3 rejects parts under 5 MiB other than the last.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts uploaded concurrently for one object.
const PARTS_IN_FLIGHT: usize = 4;

pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    prefix: StorePath,
    url: String,
    part_size: usize,
    runtime: Runtime,
}

impl fmt::Debug for ObjectStoreRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreRemote")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .field("part_size", &self.part_size)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Store(#[from] object_store::Error),
    #[error("failed to start I/O runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl ObjectStoreRemote {
    /// Connect to the object store described by `url`; `options` are backend
    /// configuration keys (`region`, `endpoint`, …).
    pub fn with_url(url: &Url, options: &BTreeMap<String, String>) -> Result<Self, OpenError> {
        let (store, prefix) = parse_url_opts(url, options.iter())?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("datum-remote-io")
            .enable_all()
            .build()?;
        Ok(Self {
            store: Arc::from(store),
            prefix,
            url: url.to_string(),
            part_size: DEFAULT_PART_SIZE,
            runtime,
        })
    }

    /// Upload in parts of `bytes`; objects no larger than one part go up in
    /// a single request.
    pub fn with_part_size(mut self, bytes: usize) -> Self {
        self.part_size = bytes.max(1);
        self
    }

    fn path(&self, key: &str) -> StorePath {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.prefix.clone(), |path, part| path.child(part))
    }

    fn relative_key(&self, location: &StorePath) -> Option<String> {
        let parts = location.prefix_match(&self.prefix)?;
        Some(
            parts
                .map(|part| part.as_ref().to_string())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }
}

/// Map a store error onto the port's taxonomy. The store's HTTP client has
/// already retried server errors and timeouts by the time one reaches us, so
/// only a connection-level cause is worth another attempt.
fn classify(key: &str, err: object_store::Error) -> RemoteError {
    let message = err.to_string();
    match &err {
        object_store::Error::NotFound { .. } => RemoteError::NotFound {
            key: key.to_string(),
        },
        object_store::Error::PermissionDenied { .. }
        | object_store::Error::Unauthenticated { .. } => RemoteError::AccessDenied {
            key: key.to_string(),
            message,
        },
        object_store::Error::Generic { source, .. } if transient_cause(key, &**source) => {
            RemoteError::Transient {
                key: key.to_string(),
                message,
            }
        }
        _ => RemoteError::Permanent {
            key: key.to_string(),
            message,
        },
    }
}

/// Walk the cause chain looking for a dropped connection or a timeout.
fn transient_cause(key: &str, err: &(dyn StdError + 'static)) -> bool {
    let mut cause = Some(err);
    while let Some(err) = cause {
        if let Some(http) = err.downcast_ref::<HttpError>() {
            if matches!(
                http.kind(),
                HttpErrorKind::Connect | HttpErrorKind::Timeout | HttpErrorKind::Interrupted
            ) {
                return true;
            }
        }
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if RemoteError::from_io(key, io).is_transient() {
                return true;
            }
        }
        cause = err.source();
    }
    false
}

/// Read until `buf` is full or `src` is exhausted.
fn fill(src: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl ObjectStoreRemote {
    /// Feed the rest of `src` into `writer`, one part at a time, after the
    /// first part has already been written.
    fn upload_parts(
        &self,
        src: &mut dyn Read,
        key: &str,
        writer: &mut WriteMultipart,
        part: &mut [u8],
    ) -> Result<(), RemoteError> {
        loop {
            let filled = fill(src, part).map_err(|e| RemoteError::from_io(key, &e))?;
            if filled == 0 {
                return Ok(());
            }
            self.runtime
                .block_on(writer.wait_for_capacity(PARTS_IN_FLIGHT))
                .map_err(|e| classify(key, e))?;
            writer.write(&part[..filled]);
            if filled < part.len() {
                return Ok(());
            }
        }
    }
}

impl RemotePort for ObjectStoreRemote {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        let path = self.path(key);
        match self.runtime.block_on(self.store.head(&path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(classify(key, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let base = self.path(prefix);
        let metas = self
            .runtime
            .block_on(self.store.list(Some(&base)).try_collect::<Vec<_>>())
            .map_err(|e| classify(prefix, e))?;
        let mut keys: Vec<String> = metas
            .iter()
            .filter_map(|meta| self.relative_key(&meta.location))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str, dest: &mut dyn Write) -> Result<(), RemoteError> {
        let path = self.path(key);
        let _context = self.runtime.enter();
        let mut stream = self
            .runtime
            .block_on(self.store.get(&path))
            .map_err(|e| classify(key, e))?
            .into_stream();
        while let Some(chunk) = self
            .runtime
            .block_on(stream.try_next())
            .map_err(|e| classify(key, e))?
        {
            dest.write_all(&chunk)
                .map_err(|e| RemoteError::from_io(key, &e))?;
        }
        Ok(())
    }

    fn put(&self, src: &mut dyn Read, key: &str) -> Result<(), RemoteError> {
        let path = self.path(key);
        let mut part = vec![0u8; self.part_size];
        let filled = fill(src, &mut part).map_err(|e| RemoteError::from_io(key, &e))?;
        if filled < self.part_size {
            part.truncate(filled);
            self.runtime
                .block_on(self.store.put(&path, Bytes::from(part).into()))
                .map_err(|e| classify(key, e))?;
            return Ok(());
        }

        // Parts are spawned onto the remote's runtime as they fill.
        let _context = self.runtime.enter();
        let upload = self
            .runtime
            .block_on(self.store.put_multipart(&path))
            .map_err(|e| classify(key, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.part_size);
        writer.write(&part);
        match self.upload_parts(src, key, &mut writer, &mut part) {
            Ok(()) => {
                self.runtime
                    .block_on(writer.finish())
                    .map_err(|e| classify(key, e))?;
                Ok(())
            }
            Err(err) => {
                if let Err(e) = self.runtime.block_on(writer.abort()) {
                    tracing::warn!("{key}: failed to abort multipart upload: {e}");
                }
                Err(err)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<(), RemoteError> {
        let path = self.path(key);
        self.runtime
            .block_on(self.store.delete(&path))
            .map_err(|e| classify(key, e))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn memory() -> ObjectStoreRemote {
        let url = Url::parse("memory:///datum").unwrap();
        ObjectStoreRemote::with_url(&url, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn put_get_list_remove_through_object_store() {
        let remote = memory();
        remote.put(&mut &b"blob"[..], "ab/cdef").unwrap();
        remote.put(&mut &b"[]"[..], "12/34.dir").unwrap();

        assert!(remote.exists("ab/cdef").unwrap());
        assert_eq!(remote.list("").unwrap(), ["12/34.dir", "ab/cdef"]);
        assert_eq!(remote.list("ab").unwrap(), ["ab/cdef"]);

        let mut out = Vec::new();
        remote.get("ab/cdef", &mut out).unwrap();
        assert_eq!(out, b"blob");

        remote.remove("ab/cdef").unwrap();
        assert!(!remote.exists("ab/cdef").unwrap());
    }

    #[test]
    fn missing_object_is_not_found() {
        let remote = memory();
        assert!(matches!(
            remote.get("00/missing", &mut Vec::new()),
            Err(RemoteError::NotFound { .. })
        ));
    }

    #[rstest]
    #[case::smaller_than_a_part(b"abc".as_slice())]
    #[case::exact_multiple(b"01234567".as_slice())]
    #[case::ragged_tail(b"0123456789".as_slice())]
    #[case::empty(b"".as_slice())]
    fn objects_move_in_parts(#[case] payload: &[u8]) {
        let remote = memory().with_part_size(4);
        remote.put(&mut &payload[..], "ab/cdef").unwrap();

        let mut out = Vec::new();
        remote.get("ab/cdef", &mut out).unwrap();
        assert_eq!(out, payload);
    }

    fn generic(source: Box<dyn StdError + Send + Sync>) -> object_store::Error {
        object_store::Error::Generic {
            store: "test",
            source,
        }
    }

    #[rstest]
    #[case::reset(io::ErrorKind::ConnectionReset, true)]
    #[case::timed_out(io::ErrorKind::TimedOut, true)]
    #[case::invalid_data(io::ErrorKind::InvalidData, false)]
    #[case::other(io::ErrorKind::Other, false)]
    fn generic_errors_follow_their_io_cause(#[case] kind: io::ErrorKind, #[case] transient: bool) {
        let err = classify("ab/cdef", generic(Box::new(io::Error::new(kind, "boom"))));
        assert_eq!(err.is_transient(), transient, "{err:?}");
    }

    #[rstest]
    #[case::connect(HttpErrorKind::Connect, true)]
    #[case::timeout(HttpErrorKind::Timeout, true)]
    #[case::decode(HttpErrorKind::Decode, false)]
    fn generic_errors_follow_their_http_cause(#[case] kind: HttpErrorKind, #[case] transient: bool) {
        let cause = HttpError::new(kind, io::Error::new(io::ErrorKind::Other, "boom"));
        let err = classify("ab/cdef", generic(Box::new(cause)));
        assert_eq!(err.is_transient(), transient, "{err:?}");
    }

    #[test]
    fn unexplained_generic_error_is_permanent() {
        let err = classify("ab/cdef", generic("bucket policy rejected the request".into()));
        assert!(matches!(err, RemoteError::Permanent { .. }), "{err:?}");
    }
}
