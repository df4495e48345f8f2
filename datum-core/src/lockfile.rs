//! `datum.lock`: per-stage snapshot of dependency and output identities at
//! the last successful execution.
//!
//! This file is the sole source of truth for staleness comparison. Lists are
//! sorted by path and default-parameter-file entries come first, so that
//! re-running an unchanged pipeline produces a byte-identical file.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::error::{io_err, CoreError};
use crate::paths::{DEFAULT_PARAMS_FILE, LOCK_FILE};
use crate::types::ContentId;

/// Recorded identity of one dependency or output (stage-relative path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChecksum {
    pub path: PathBuf,
    pub checksum: ContentId,
}

/// Parameter values grouped by parameter file.
pub type ParamValues = BTreeMap<PathBuf, BTreeMap<String, serde_yaml::Value>>;

/// Last-known-good snapshot of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "LockRecordDoc", try_from = "LockRecordDoc")]
pub struct LockRecord {
    pub cmd: String,
    pub deps: Vec<PathChecksum>,
    pub params: ParamValues,
    pub outs: Vec<PathChecksum>,
}

impl LockRecord {
    pub fn dep_checksum(&self, path: &Path) -> Option<&ContentId> {
        self.deps
            .iter()
            .find(|d| d.path == path)
            .map(|d| &d.checksum)
    }

    pub fn out_checksum(&self, path: &Path) -> Option<&ContentId> {
        self.outs
            .iter()
            .find(|o| o.path == path)
            .map(|o| &o.checksum)
    }
}

#[derive(Serialize, Deserialize)]
struct LockRecordDoc {
    cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    deps: Vec<PathChecksum>,
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    params: serde_yaml::Mapping,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outs: Vec<PathChecksum>,
}

impl From<LockRecord> for LockRecordDoc {
    fn from(record: LockRecord) -> Self {
        let mut deps = record.deps;
        deps.sort_by(|a, b| a.path.cmp(&b.path));
        let mut outs = record.outs;
        outs.sort_by(|a, b| a.path.cmp(&b.path));

        let mut files: Vec<(PathBuf, BTreeMap<String, serde_yaml::Value>)> =
            record.params.into_iter().collect();
        files.sort_by_key(|(file, _)| file != Path::new(DEFAULT_PARAMS_FILE));

        let mut params = serde_yaml::Mapping::new();
        for (file, values) in files {
            let mut inner = serde_yaml::Mapping::new();
            for (key, value) in values {
                inner.insert(serde_yaml::Value::String(key), value);
            }
            params.insert(
                serde_yaml::Value::String(file.to_string_lossy().into_owned()),
                serde_yaml::Value::Mapping(inner),
            );
        }

        Self {
            cmd: record.cmd,
            deps,
            params,
            outs,
        }
    }
}

impl TryFrom<LockRecordDoc> for LockRecord {
    type Error = String;

    fn try_from(doc: LockRecordDoc) -> Result<Self, Self::Error> {
        let mut params = ParamValues::new();
        for (file, values) in doc.params {
            let file = file
                .as_str()
                .ok_or_else(|| format!("parameter file name must be a string, got {file:?}"))?
                .to_string();
            let values: BTreeMap<String, serde_yaml::Value> =
                serde_yaml::from_value(values).map_err(|e| e.to_string())?;
            params.insert(PathBuf::from(file), values);
        }
        Ok(Self {
            cmd: doc.cmd,
            deps: doc.deps,
            params,
            outs: doc.outs,
        })
    }
}

/// All lock records, keyed by stage name.
pub type LockFile = BTreeMap<String, LockRecord>;

/// `<root>/datum.lock`: pure, no I/O.
pub fn path_at(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

/// Load all lock records. Returns an empty set if the file does not exist.
pub fn load_at(root: &Path) -> Result<LockFile, CoreError> {
    let path = path_at(root);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockFile::new()),
        Err(err) => return Err(io_err(&path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(LockFile::new());
    }
    serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse { path, source })
}

/// Atomically save all lock records; an empty set removes the file.
pub fn save_at(root: &Path, lock: &LockFile) -> Result<(), CoreError> {
    let path = path_at(root);
    if lock.is_empty() {
        return match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        };
    }
    let yaml = serde_yaml::to_string(lock)?;
    write_atomic(&path, yaml.as_bytes())
}

/// Replace the record for one stage.
pub fn update_at(root: &Path, name: &str, record: LockRecord) -> Result<(), CoreError> {
    let mut lock = load_at(root)?;
    lock.insert(name.to_string(), record);
    save_at(root, &lock)
}

/// Drop the record for one stage; returns whether it existed.
pub fn remove_at(root: &Path, name: &str) -> Result<bool, CoreError> {
    let mut lock = load_at(root)?;
    let existed = lock.remove(name).is_some();
    if existed {
        save_at(root, &lock)?;
    }
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pc(path: &str, checksum: &str) -> PathChecksum {
        PathChecksum {
            path: PathBuf::from(path),
            checksum: ContentId::from(checksum),
        }
    }

    fn sample() -> LockRecord {
        let mut params = ParamValues::new();
        params.insert(
            PathBuf::from("conf.yaml"),
            BTreeMap::from([("lr".to_string(), serde_yaml::Value::from(0.1))]),
        );
        params.insert(
            PathBuf::from(DEFAULT_PARAMS_FILE),
            BTreeMap::from([("seed".to_string(), serde_yaml::Value::from(7))]),
        );
        LockRecord {
            cmd: "python train.py".into(),
            deps: vec![pc("train.py", "bb"), pc("data.csv", "aa")],
            params,
            outs: vec![pc("model.bin", "cc")],
        }
    }

    #[test]
    fn roundtrip_save_load() {
        let tmp = TempDir::new().unwrap();
        update_at(tmp.path(), "train", sample()).unwrap();
        let lock = load_at(tmp.path()).unwrap();
        let record = &lock["train"];
        assert_eq!(record.cmd, "python train.py");
        assert_eq!(
            record.dep_checksum(Path::new("data.csv")),
            Some(&ContentId::from("aa"))
        );
        assert_eq!(record.params.len(), 2);
    }

    #[test]
    fn lists_sorted_and_default_params_first() {
        let tmp = TempDir::new().unwrap();
        update_at(tmp.path(), "train", sample()).unwrap();
        let yaml = std::fs::read_to_string(path_at(tmp.path())).unwrap();
        let data = yaml.find("data.csv").unwrap();
        let train = yaml.find("train.py").unwrap();
        assert!(data < train, "deps must be sorted by path:\n{yaml}");
        let default = yaml.find(DEFAULT_PARAMS_FILE).unwrap();
        let custom = yaml.find("conf.yaml").unwrap();
        assert!(default < custom, "default params file first:\n{yaml}");
    }

    #[test]
    fn remove_last_record_deletes_file() {
        let tmp = TempDir::new().unwrap();
        update_at(tmp.path(), "train", sample()).unwrap();
        assert!(remove_at(tmp.path(), "train").unwrap());
        assert!(!path_at(tmp.path()).exists());
        assert!(!remove_at(tmp.path(), "train").unwrap());
    }

    #[test]
    fn missing_lock_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(load_at(tmp.path()).unwrap().is_empty());
    }
}
