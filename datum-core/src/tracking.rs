//! `*.datum`: single-output tracking records for ad-hoc tracked paths.
//!
//! `data/images` is tracked by `data/images.datum`:
//!
//! ```yaml
//! outs:
//! - checksum: 3f2a….dir
//!   path: images
//! ```
//!
//! Output paths are relative to the directory holding the record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::atomic::write_atomic;
use crate::error::{io_err, CoreError};
use crate::paths::{self, DOT_DIR, TRACKING_SUFFIX};
use crate::types::{ContentId, Output, Stage, StageKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOut {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ContentId>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackingRecord {
    #[serde(default)]
    pub outs: Vec<TrackedOut>,
}

impl TrackingRecord {
    pub fn single(path: impl Into<PathBuf>, checksum: ContentId) -> Self {
        Self {
            outs: vec![TrackedOut {
                checksum: Some(checksum),
                path: path.into(),
            }],
        }
    }

    /// View this record as a command-less stage named after the record path
    /// (`record` is repo-relative).
    pub fn to_stage(&self, record: &Path) -> Stage {
        let wdir = record
            .parent()
            .map(paths::normalize)
            .unwrap_or_default();
        Stage {
            name: paths::to_posix(record),
            kind: StageKind::Tracking {
                record: record.to_path_buf(),
            },
            cmd: None,
            wdir,
            deps: vec![],
            params: vec![],
            outs: self
                .outs
                .iter()
                .map(|o| Output {
                    checksum: o.checksum.clone(),
                    ..Output::new(o.path.clone())
                })
                .collect(),
            frozen: false,
            always_changed: false,
        }
    }
}

/// `data/images` → `data/images.datum`.
pub fn record_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TRACKING_SUFFIX);
    target.with_file_name(name)
}

pub fn load(path: &Path) -> Result<TrackingRecord, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save(path: &Path, record: &TrackingRecord) -> Result<(), CoreError> {
    let yaml = serde_yaml::to_string(record)?;
    write_atomic(path, yaml.as_bytes())
}

/// Repo-relative paths of every tracking record below `root`, sorted.
/// The `.datum/` directory is never descended into.
pub fn list_at(root: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut records = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == DOT_DIR));
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            io_err(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.len() > TRACKING_SUFFIX.len() && name.ends_with(TRACKING_SUFFIX) {
            if let Ok(relative) = entry.path().strip_prefix(root) {
                records.push(relative.to_path_buf());
            }
        }
    }
    records.sort();
    Ok(records)
}

/// Every tracking record below `root`, viewed as stages.
pub fn load_stages_at(root: &Path) -> Result<Vec<Stage>, CoreError> {
    let mut stages = Vec::new();
    for record in list_at(root)? {
        let parsed = load(&root.join(&record))?;
        stages.push(parsed.to_stage(&record));
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn record_path_appends_suffix() {
        assert_eq!(
            record_path_for(Path::new("data/images")),
            PathBuf::from("data/images.datum")
        );
        assert_eq!(record_path_for(Path::new("foo")), PathBuf::from("foo.datum"));
    }

    #[test]
    fn saved_record_has_checksum_and_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("foo.datum");
        save(&path, &TrackingRecord::single("foo", ContentId::from("abc"))).unwrap();
        let yaml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(yaml, "outs:\n- checksum: abc\n  path: foo\n");
        assert_eq!(load(&path).unwrap().outs[0].path, PathBuf::from("foo"));
    }

    #[test]
    fn hand_edited_checksum_outside_the_cache_is_refused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("foo.datum");
        std::fs::write(&path, "outs:\n- checksum: ab/../../../etc/passwd\n  path: foo\n").unwrap();
        assert!(matches!(load(&path), Err(CoreError::Parse { .. })));
    }

    #[test]
    fn list_skips_dot_dir_and_maps_to_stages() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::create_dir_all(root.join(DOT_DIR)).unwrap();
        std::fs::write(root.join(DOT_DIR).join("x.datum"), "outs: []\n").unwrap();
        save(
            &root.join("data").join("raw.datum"),
            &TrackingRecord::single("raw", ContentId::from("abc")),
        )
        .unwrap();

        let records = list_at(root).unwrap();
        assert_eq!(records, vec![PathBuf::from("data/raw.datum")]);

        let stages = load_stages_at(root).unwrap();
        assert_eq!(stages[0].name, "data/raw.datum");
        assert!(stages[0].cmd.is_none());
        assert_eq!(stages[0].out_paths(), vec![PathBuf::from("data/raw")]);
    }
}
