//! Domain types for datum.
//!
//! All path fields use `PathBuf`; paths inside a [`Stage`] are relative to the
//! stage's working directory, which is itself relative to the repository root.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::InvalidContentId;
use crate::paths;

/// Reserved identity suffix marking a directory object.
pub const DIR_SUFFIX: &str = ".dir";

// ---------------------------------------------------------------------------
// Content identities
// ---------------------------------------------------------------------------

/// Content-derived identity of a blob (hex digest) or of a directory listing
/// (hex digest + [`DIR_SUFFIX`]).
///
/// Deserialization validates the form, so an identity read from a record can
/// never address anything outside the cache partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentId(pub String);

impl ContentId {
    /// Check that `s` is lowercase hex, optionally followed by [`DIR_SUFFIX`].
    pub fn parse(s: &str) -> Result<Self, InvalidContentId> {
        let digest = s.strip_suffix(DIR_SUFFIX).unwrap_or(s);
        let hex = digest
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if digest.is_empty() || !hex {
            return Err(InvalidContentId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Identity for a directory listing whose serialized form hashes to `digest`.
    pub fn for_dir(digest: &str) -> Self {
        Self(format!("{digest}{DIR_SUFFIX}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dir(&self) -> bool {
        self.0.ends_with(DIR_SUFFIX)
    }

    /// Split into the two-character partition and the remainder used for the
    /// on-disk and remote layout (`ab/cdef…`).
    pub fn split(&self) -> (&str, &str) {
        let cut = self.0.char_indices().nth(2).map_or(self.0.len(), |(i, _)| i);
        self.0.split_at(cut)
    }

    /// `ab/cdef…`: the backend-agnostic object key.
    pub fn object_key(&self) -> String {
        let (head, tail) = self.split();
        format!("{head}/{tail}")
    }

    /// Inverse of [`ContentId::object_key`]; `None` for anything that is not
    /// a two-level key.
    pub fn from_object_key(key: &str) -> Option<Self> {
        let key = key.trim_start_matches('/');
        let (head, tail) = key.split_once('/')?;
        if head.len() != 2 || tail.is_empty() || tail.contains('/') {
            return None;
        }
        Self::parse(&format!("{head}{tail}")).ok()
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ContentId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// One file inside a directory object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirEntry {
    pub checksum: ContentId,
    /// Path relative to the directory root, always `/`-separated.
    pub relpath: String,
}

/// Ordered-by-path listing of a directory's files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirObject {
    entries: Vec<DirEntry>,
}

impl DirObject {
    /// Build a listing; entries are sorted by `relpath` so that the
    /// serialized form does not depend on traversal order.
    pub fn new(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        entries.dedup_by(|a, b| a.relpath == b.relpath);
        Self { entries }
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, relpath: &str) -> Option<&ContentId> {
        self.entries
            .binary_search_by(|e| e.relpath.as_str().cmp(relpath))
            .ok()
            .map(|i| &self.entries[i].checksum)
    }
}

// ---------------------------------------------------------------------------
// Link strategies
// ---------------------------------------------------------------------------

/// Mechanism used to materialize cached content into the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Reflink,
    Hardlink,
    Symlink,
    Copy,
}

impl LinkType {
    /// Default fallback list: copy-on-write clone, then a plain copy.
    pub fn defaults() -> Vec<LinkType> {
        vec![LinkType::Reflink, LinkType::Copy]
    }

    /// Whether the workspace path shares storage with the cache entry.
    pub fn shares_storage(self) -> bool {
        matches!(self, LinkType::Hardlink | LinkType::Symlink)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Reflink => write!(f, "reflink"),
            LinkType::Hardlink => write!(f, "hardlink"),
            LinkType::Symlink => write!(f, "symlink"),
            LinkType::Copy => write!(f, "copy"),
        }
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reflink" => Ok(LinkType::Reflink),
            "hardlink" => Ok(LinkType::Hardlink),
            "symlink" => Ok(LinkType::Symlink),
            "copy" => Ok(LinkType::Copy),
            other => Err(format!(
                "unknown link type '{other}'; expected: reflink, hardlink, symlink, copy"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage members
// ---------------------------------------------------------------------------

/// How an output is classified in the pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Out,
    Metric,
    Plot,
}

/// A tracked path belonging to exactly one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    /// Relative to the owning stage's working directory.
    pub path: PathBuf,
    pub checksum: Option<ContentId>,
    /// Store content in the cache (`cache: false` opts out).
    pub cache: bool,
    /// Keep the workspace copy in place while the stage re-runs.
    pub persist: bool,
    pub kind: OutputKind,
    /// Metric/plot sub-properties, kept verbatim.
    pub props: BTreeMap<String, serde_yaml::Value>,
}

impl Output {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checksum: None,
            cache: true,
            persist: false,
            kind: OutputKind::Out,
            props: BTreeMap::new(),
        }
    }

    pub fn with_checksum(mut self, checksum: ContentId) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// A path a stage reads, with the identity observed at its last successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Relative to the owning stage's working directory.
    pub path: PathBuf,
    pub checksum: Option<ContentId>,
}

impl Dependency {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checksum: None,
        }
    }
}

/// Parameter keys read from one YAML parameter file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDependency {
    /// Relative to the owning stage's working directory.
    pub file: PathBuf,
    /// Dotted key paths, e.g. `train.lr`.
    pub keys: Vec<String>,
}

/// Where a stage is declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// A named entry of `datum.yaml`.
    Pipeline,
    /// A `*.datum` record produced by `add`; the path is repo-relative.
    Tracking { record: PathBuf },
}

/// A declared unit of computation.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    /// `None` for tracking records, which never execute.
    pub cmd: Option<String>,
    /// Relative to the repository root; empty for the root itself.
    pub wdir: PathBuf,
    pub deps: Vec<Dependency>,
    pub params: Vec<ParamDependency>,
    pub outs: Vec<Output>,
    pub frozen: bool,
    pub always_changed: bool,
}

impl Stage {
    /// A pipeline stage running `cmd` from the repository root.
    pub fn pipeline(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Pipeline,
            cmd: Some(cmd.into()),
            wdir: PathBuf::new(),
            deps: vec![],
            params: vec![],
            outs: vec![],
            frozen: false,
            always_changed: false,
        }
    }

    /// Resolve a stage-relative path to a normalized repo-relative path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        paths::normalize(&self.wdir.join(path))
    }

    /// Repo-relative paths of every output.
    pub fn out_paths(&self) -> Vec<PathBuf> {
        self.outs.iter().map(|o| self.resolve(&o.path)).collect()
    }

    /// Repo-relative paths of every file dependency (parameter files included).
    pub fn dep_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.deps.iter().map(|d| self.resolve(&d.path)).collect();
        paths.extend(self.params.iter().map(|p| self.resolve(&p.file)));
        paths
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.kind, StageKind::Tracking { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn content_id_layout_split() {
        let id = ContentId::from("abcdef0123");
        assert_eq!(id.split(), ("ab", "cdef0123"));
        assert_eq!(id.object_key(), "ab/cdef0123");
        assert_eq!(ContentId::from_object_key("ab/cdef0123"), Some(id));
    }

    #[test]
    fn dir_ids_carry_suffix() {
        let id = ContentId::for_dir("ff00");
        assert!(id.is_dir());
        assert_eq!(id.object_key(), "ff/00.dir");
        assert!(!ContentId::from("ff00").is_dir());
    }

    #[test]
    fn object_key_rejects_foreign_layout() {
        assert_eq!(ContentId::from_object_key("abc/def"), None);
        assert_eq!(ContentId::from_object_key("ab/c/d"), None);
        assert_eq!(ContentId::from_object_key("nosplit"), None);
        assert_eq!(ContentId::from_object_key("../etc"), None);
    }

    #[rstest]
    #[case("../x")]
    #[case("ab/../../y")]
    #[case("ABCDEF")]
    #[case("12zz")]
    #[case(".dir")]
    #[case("")]
    fn malformed_identities_are_rejected(#[case] raw: &str) {
        assert_eq!(ContentId::parse(raw), Err(InvalidContentId(raw.to_string())));
        assert!(serde_yaml::from_str::<ContentId>(&format!("{raw:?}")).is_err());
    }

    #[rstest]
    #[case("0123abcdef")]
    #[case("ff00.dir")]
    fn well_formed_identities_deserialize(#[case] raw: &str) {
        let id: ContentId = serde_yaml::from_str(&format!("{raw:?}")).unwrap();
        assert_eq!(id.as_str(), raw);
    }

    #[test]
    fn dir_object_sorts_entries() {
        let obj = DirObject::new(vec![
            DirEntry {
                checksum: "2".into(),
                relpath: "b".into(),
            },
            DirEntry {
                checksum: "1".into(),
                relpath: "a/x".into(),
            },
        ]);
        let paths: Vec<_> = obj.entries().iter().map(|e| e.relpath.as_str()).collect();
        assert_eq!(paths, ["a/x", "b"]);
        assert_eq!(obj.get("b"), Some(&ContentId::from("2")));
        assert_eq!(obj.get("c"), None);
    }

    #[test]
    fn link_type_parse_and_display() {
        assert_eq!("HardLink".parse::<LinkType>(), Ok(LinkType::Hardlink));
        assert_eq!(LinkType::Symlink.to_string(), "symlink");
        assert!("teleport".parse::<LinkType>().is_err());
    }

    #[test]
    fn stage_resolves_paths_through_wdir() {
        let mut stage = Stage::pipeline("train", "python train.py");
        stage.wdir = PathBuf::from("models");
        stage.outs.push(Output::new("../data/out.bin"));
        stage.deps.push(Dependency::new("./in.csv"));
        assert_eq!(stage.out_paths(), vec![PathBuf::from("data/out.bin")]);
        assert_eq!(stage.dep_paths(), vec![PathBuf::from("models/in.csv")]);
    }
}
