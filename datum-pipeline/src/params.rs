//! Parameter values read from YAML parameter files.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use datum_core::error::io_err;
use datum_core::lockfile::ParamValues;
use datum_core::{CoreError, Stage};

use crate::error::StageError;

/// Look up a dotted key (`train.optimizer.lr`) in a YAML document.
pub fn lookup<'a>(doc: &'a serde_yaml::Value, key: &str) -> Option<&'a serde_yaml::Value> {
    key.split('.').try_fold(doc, |node, part| node.get(part))
}

/// Current values of every parameter `stage` declares, keyed by the
/// stage-relative parameter file. Absent files and keys are left out.
pub fn current_values(root: &Path, stage: &Stage) -> Result<ParamValues, StageError> {
    let mut docs: HashMap<PathBuf, Option<serde_yaml::Value>> = HashMap::new();
    let mut values = ParamValues::new();
    for dep in &stage.params {
        if !docs.contains_key(&dep.file) {
            let path = root.join(stage.resolve(&dep.file));
            docs.insert(dep.file.clone(), load(&path)?);
        }
        let Some(Some(doc)) = docs.get(&dep.file) else {
            continue;
        };
        let entry = values.entry(dep.file.clone()).or_insert_with(BTreeMap::new);
        for key in &dep.keys {
            if let Some(value) = lookup(doc, key) {
                entry.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(values)
}

/// Like [`current_values`], but every declared key must resolve.
pub fn required_values(root: &Path, stage: &Stage) -> Result<ParamValues, StageError> {
    let values = current_values(root, stage)?;
    for dep in &stage.params {
        for key in &dep.keys {
            let found = values.get(&dep.file).is_some_and(|v| v.contains_key(key));
            if !found {
                return Err(StageError::ParamMissing {
                    file: dep.file.clone(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(values)
}

fn load(path: &Path) -> Result<Option<serde_yaml::Value>, StageError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err).into()),
    };
    let doc = serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_core::ParamDependency;
    use tempfile::TempDir;

    fn stage_reading(file: &str, keys: &[&str]) -> Stage {
        let mut stage = Stage::pipeline("train", "true");
        stage.params = vec![ParamDependency {
            file: file.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }];
        stage
    }

    #[test]
    fn dotted_keys_descend_into_mappings() {
        let doc: serde_yaml::Value = serde_yaml::from_str("train:\n  lr: 0.1\n  layers: 3\n").unwrap();
        assert_eq!(lookup(&doc, "train.lr"), Some(&serde_yaml::Value::from(0.1)));
        assert_eq!(lookup(&doc, "train.missing"), None);
        assert_eq!(lookup(&doc, "train.lr.deeper"), None);
    }

    #[test]
    fn values_are_grouped_by_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("params.yaml"), "seed: 7\ntrain:\n  lr: 0.5\n").unwrap();
        let stage = stage_reading("params.yaml", &["seed", "train.lr"]);
        let values = current_values(tmp.path(), &stage).unwrap();
        let file = &values[Path::new("params.yaml")];
        assert_eq!(file["seed"], serde_yaml::Value::from(7));
        assert_eq!(file["train.lr"], serde_yaml::Value::from(0.5));
    }

    #[test]
    fn missing_key_is_an_error_only_when_required() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("params.yaml"), "seed: 7\n").unwrap();
        let stage = stage_reading("params.yaml", &["seed", "epochs"]);
        assert_eq!(current_values(tmp.path(), &stage).unwrap().len(), 1);
        assert!(matches!(
            required_values(tmp.path(), &stage),
            Err(StageError::ParamMissing { key, .. }) if key == "epochs"
        ));
    }
}
