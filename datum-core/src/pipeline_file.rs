//! `datum.yaml`: declarative pipeline stage definitions.
//!
//! ```yaml
//! stages:
//!   prepare:
//!     cmd: python prepare.py
//!     deps: [data/raw.csv, prepare.py]
//!     params: [seed, {conf/train.yaml: [lr]}]
//!     outs: [data/prepared, {data/cache.bin: {cache: false}}]
//!     metrics: [{scores.json: {persist: true}}]
//! ```
//!
//! Stage order in the file is declaration order and is preserved on save.
//! Keys with empty/default values are omitted on serialization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::error::{io_err, CoreError};
use crate::paths::{self, DEFAULT_PARAMS_FILE, PIPELINE_FILE};
use crate::types::{Dependency, Output, OutputKind, ParamDependency, Stage, StageKind};

// ---------------------------------------------------------------------------
// Serialized shape
// ---------------------------------------------------------------------------

/// One stage as written in `datum.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamsEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outs: Vec<OutEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<OutEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plots: Vec<OutEntry>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub always_changed: bool,
}

/// A bare key of the default parameter file, or keys grouped by file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamsEntry {
    Key(String),
    File(BTreeMap<PathBuf, Vec<String>>),
}

/// A bare output path, or a single-key map from the path to its flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutEntry {
    Path(PathBuf),
    Annotated(BTreeMap<PathBuf, OutFlags>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutFlags {
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub cache: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub persist: bool,
    /// Metric/plot sub-properties.
    #[serde(flatten)]
    pub props: BTreeMap<String, serde_yaml::Value>,
}

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

fn is_false(b: &bool) -> bool {
    !*b
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl StageDef {
    /// Build the in-memory stage; `file` is only used for error context.
    pub fn into_stage(self, name: &str, file: &Path) -> Result<Stage, CoreError> {
        let wdir = paths::normalize(self.wdir.as_deref().unwrap_or(Path::new(".")));

        let mut outs = Vec::new();
        for (entries, kind) in [
            (self.outs, OutputKind::Out),
            (self.metrics, OutputKind::Metric),
            (self.plots, OutputKind::Plot),
        ] {
            for entry in entries {
                outs.push(out_from_entry(entry, kind, name, file)?);
            }
        }

        Ok(Stage {
            name: name.to_string(),
            kind: StageKind::Pipeline,
            cmd: Some(self.cmd),
            wdir,
            deps: self.deps.into_iter().map(Dependency::new).collect(),
            params: params_from_entries(self.params),
            outs,
            frozen: self.frozen,
            always_changed: self.always_changed,
        })
    }

    /// Serialize a stage back to its declarative form: lists sorted by path,
    /// default parameter file keys first, flags only when non-default.
    pub fn from_stage(stage: &Stage) -> Self {
        let mut deps: Vec<PathBuf> = stage.deps.iter().map(|d| d.path.clone()).collect();
        deps.sort();

        let mut sorted_outs: Vec<&Output> = stage.outs.iter().collect();
        sorted_outs.sort_by(|a, b| a.path.cmp(&b.path));
        let (mut outs, mut metrics, mut plots) = (Vec::new(), Vec::new(), Vec::new());
        for out in sorted_outs {
            let bucket = match out.kind {
                OutputKind::Out => &mut outs,
                OutputKind::Metric => &mut metrics,
                OutputKind::Plot => &mut plots,
            };
            bucket.push(entry_from_out(out));
        }

        let wdir = if stage.wdir.as_os_str().is_empty() {
            None
        } else {
            Some(stage.wdir.clone())
        };

        Self {
            cmd: stage.cmd.clone().unwrap_or_default(),
            wdir,
            deps,
            params: entries_from_params(&stage.params),
            outs,
            metrics,
            plots,
            frozen: stage.frozen,
            always_changed: stage.always_changed,
        }
    }
}

fn out_from_entry(
    entry: OutEntry,
    kind: OutputKind,
    stage: &str,
    file: &Path,
) -> Result<Output, CoreError> {
    match entry {
        OutEntry::Path(path) => Ok(Output {
            kind,
            ..Output::new(path)
        }),
        OutEntry::Annotated(map) => {
            let mut entries = map.into_iter();
            match (entries.next(), entries.next()) {
                (Some((path, flags)), None) => Ok(Output {
                    path,
                    checksum: None,
                    cache: flags.cache,
                    persist: flags.persist,
                    kind,
                    props: flags.props,
                }),
                _ => Err(CoreError::Invalid {
                    path: file.to_path_buf(),
                    message: format!(
                        "stage '{stage}': annotated output must map exactly one path to its flags"
                    ),
                }),
            }
        }
    }
}

fn entry_from_out(out: &Output) -> OutEntry {
    if out.cache && !out.persist && out.props.is_empty() {
        return OutEntry::Path(out.path.clone());
    }
    let flags = OutFlags {
        cache: out.cache,
        persist: out.persist,
        props: out.props.clone(),
    };
    OutEntry::Annotated(BTreeMap::from([(out.path.clone(), flags)]))
}

fn params_from_entries(entries: Vec<ParamsEntry>) -> Vec<ParamDependency> {
    let mut by_file: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for entry in entries {
        match entry {
            ParamsEntry::Key(key) => by_file
                .entry(PathBuf::from(DEFAULT_PARAMS_FILE))
                .or_default()
                .push(key),
            ParamsEntry::File(map) => {
                for (file, keys) in map {
                    by_file.entry(file).or_default().extend(keys);
                }
            }
        }
    }
    let mut params: Vec<ParamDependency> = by_file
        .into_iter()
        .map(|(file, mut keys)| {
            keys.sort();
            keys.dedup();
            ParamDependency { file, keys }
        })
        .collect();
    params.sort_by_key(|p| p.file != Path::new(DEFAULT_PARAMS_FILE));
    params
}

fn entries_from_params(params: &[ParamDependency]) -> Vec<ParamsEntry> {
    let mut sorted: Vec<&ParamDependency> = params.iter().filter(|p| !p.keys.is_empty()).collect();
    sorted.sort_by(|a, b| a.file.cmp(&b.file));

    let mut defaults = Vec::new();
    let mut others = Vec::new();
    for param in sorted {
        let mut keys = param.keys.clone();
        keys.sort();
        if param.file == Path::new(DEFAULT_PARAMS_FILE) {
            defaults.extend(keys.into_iter().map(ParamsEntry::Key));
        } else {
            others.push(ParamsEntry::File(BTreeMap::from([(param.file.clone(), keys)])));
        }
    }
    defaults.extend(others);
    defaults
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PipelineDoc {
    #[serde(default)]
    stages: serde_yaml::Mapping,
}

/// `<root>/datum.yaml`: pure, no I/O.
pub fn path_at(root: &Path) -> PathBuf {
    root.join(PIPELINE_FILE)
}

/// Load every pipeline stage in declaration order.
///
/// Returns an empty list if the file does not exist, `CoreError::Parse`
/// (with path + line context) if malformed.
pub fn load_at(root: &Path) -> Result<Vec<Stage>, CoreError> {
    let path = path_at(root);
    if !path.exists() {
        return Ok(vec![]);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(vec![]);
    }
    let doc: PipelineDoc = serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse {
        path: path.clone(),
        source,
    })?;

    let mut stages = Vec::with_capacity(doc.stages.len());
    for (key, value) in doc.stages {
        let Some(name) = key.as_str() else {
            return Err(CoreError::Invalid {
                path,
                message: format!("stage name must be a string, got {key:?}"),
            });
        };
        let def: StageDef =
            serde_yaml::from_value(value).map_err(|source| CoreError::Parse {
                path: path.clone(),
                source,
            })?;
        stages.push(def.into_stage(name, &path)?);
    }
    Ok(stages)
}

/// Atomically rewrite `datum.yaml` with the pipeline stages of `stages`.
pub fn save_at(root: &Path, stages: &[Stage]) -> Result<(), CoreError> {
    let mut mapping = serde_yaml::Mapping::new();
    for stage in stages.iter().filter(|s| s.kind == StageKind::Pipeline) {
        let def = serde_yaml::to_value(StageDef::from_stage(stage))?;
        mapping.insert(serde_yaml::Value::String(stage.name.clone()), def);
    }
    let mut doc = serde_yaml::Mapping::new();
    doc.insert("stages".into(), serde_yaml::Value::Mapping(mapping));
    let yaml = serde_yaml::to_string(&doc)?;
    write_atomic(&path_at(root), yaml.as_bytes())
}

/// Insert or replace the stage with the same name, keeping its position.
pub fn upsert_at(root: &Path, stage: &Stage) -> Result<(), CoreError> {
    let mut stages = load_at(root)?;
    match stages.iter_mut().find(|s| s.name == stage.name) {
        Some(existing) => *existing = stage.clone(),
        None => stages.push(stage.clone()),
    }
    save_at(root, &stages)
}

/// Remove a stage by name; returns whether it existed.
pub fn remove_at(root: &Path, name: &str) -> Result<bool, CoreError> {
    let mut stages = load_at(root)?;
    let before = stages.len();
    stages.retain(|s| s.name != name);
    if stages.len() == before {
        return Ok(false);
    }
    save_at(root, &stages)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
