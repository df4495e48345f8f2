//! Repository configuration at `.datum/config.yaml`.
//!
//! ```yaml
//! core:
//!   remote: storage
//!   jobs: 8
//! cache:
//!   type: [reflink, hardlink, copy]
//! remotes:
//!   storage:
//!     url: s3://bucket/datum
//!     region: eu-west-1
//! ```
//!
//! # API pattern
//!
//! Every function takes the repository root explicitly (`*_at(root, …)`);
//! saves go through [`write_atomic`].

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::error::{io_err, CoreError};
use crate::paths;
use crate::types::LinkType;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub core: CoreSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remotes: BTreeMap<String, RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoreSection {
    /// Name of the default remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Transfer parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSection {
    /// Ordered link strategy fallback list.
    #[serde(rename = "type", default = "LinkType::defaults")]
    pub link_types: Vec<LinkType>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            link_types: LinkType::defaults(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    /// Backend-specific options, kept verbatim.
    #[serde(flatten)]
    pub options: BTreeMap<String, String>,
}

impl RepoConfig {
    /// Transfer parallelism: configured value, or four workers per core.
    pub fn jobs(&self) -> usize {
        self.core
            .jobs
            .filter(|j| *j > 0)
            .unwrap_or_else(default_jobs)
    }

    /// Look up `name`, or the default remote when `name` is `None`.
    pub fn resolve_remote(&self, name: Option<&str>) -> Result<(String, &RemoteConfig), CoreError> {
        let name = match name {
            Some(name) => name.to_ascii_lowercase(),
            None => self.core.remote.clone().ok_or(CoreError::NoDefaultRemote)?,
        };
        let remote = self
            .remotes
            .get(&name)
            .ok_or_else(|| CoreError::UnknownRemote { name: name.clone() })?;
        Ok((name, remote))
    }
}

pub fn default_jobs() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    4 * cores
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<root>/.datum/config.yaml`: pure, no I/O.
pub fn path_at(root: &Path) -> PathBuf {
    paths::config_path(root)
}

/// Load the configuration; a missing file yields the defaults.
pub fn load_at(root: &Path) -> Result<RepoConfig, CoreError> {
    let path = path_at(root);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(RepoConfig::default()),
        Err(err) => return Err(io_err(&path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(RepoConfig::default());
    }
    let config: RepoConfig =
        serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse {
            path: path.clone(),
            source,
        })?;
    if config.cache.link_types.is_empty() {
        return Err(CoreError::Invalid {
            path,
            message: "cache.type must list at least one link type".into(),
        });
    }
    Ok(config)
}

pub fn save_at(root: &Path, config: &RepoConfig) -> Result<(), CoreError> {
    let yaml = serde_yaml::to_string(config)?;
    write_atomic(&path_at(root), yaml.as_bytes())
}

fn edit_at<T>(
    root: &Path,
    f: impl FnOnce(&mut RepoConfig) -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let mut config = load_at(root)?;
    let out = f(&mut config)?;
    save_at(root, &config)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Remote management
// ---------------------------------------------------------------------------

/// Register a remote. Names are case-insensitive.
pub fn remote_add_at(
    root: &Path,
    name: &str,
    url: &str,
    make_default: bool,
    force: bool,
) -> Result<(), CoreError> {
    let name = name.to_ascii_lowercase();
    edit_at(root, |config| {
        if config.remotes.contains_key(&name) && !force {
            return Err(CoreError::DuplicateRemote { name: name.clone() });
        }
        config.remotes.insert(
            name.clone(),
            RemoteConfig {
                url: url.to_string(),
                options: BTreeMap::new(),
            },
        );
        if make_default {
            tracing::info!(remote = %name, "setting default remote");
            config.core.remote = Some(name.clone());
        }
        Ok(())
    })
}

/// Remove a remote, clearing the default if it pointed at it.
pub fn remote_remove_at(root: &Path, name: &str) -> Result<(), CoreError> {
    let name = name.to_ascii_lowercase();
    edit_at(root, |config| {
        if config.remotes.remove(&name).is_none() {
            return Err(CoreError::UnknownRemote { name: name.clone() });
        }
        if config.core.remote.as_deref() == Some(name.as_str()) {
            config.core.remote = None;
        }
        Ok(())
    })
}

/// Set (`Some`) or unset (`None`) one option of a remote.
pub fn remote_modify_at(
    root: &Path,
    name: &str,
    option: &str,
    value: Option<&str>,
) -> Result<(), CoreError> {
    let name = name.to_ascii_lowercase();
    let path = path_at(root);
    edit_at(root, |config| {
        let remote = config
            .remotes
            .get_mut(&name)
            .ok_or_else(|| CoreError::UnknownRemote { name: name.clone() })?;
        match (option, value) {
            ("url", Some(url)) => remote.url = url.to_string(),
            ("url", None) => {
                return Err(CoreError::Invalid {
                    path,
                    message: format!("remote '{name}': url cannot be unset"),
                })
            }
            (key, Some(v)) => {
                remote.options.insert(key.to_string(), v.to_string());
            }
            (key, None) => {
                remote.options.remove(key);
            }
        }
        Ok(())
    })
}

/// Set or clear the default remote; a new default must already exist.
pub fn remote_default_at(root: &Path, name: Option<&str>) -> Result<(), CoreError> {
    edit_at(root, |config| {
        match name {
            Some(name) => {
                let name = name.to_ascii_lowercase();
                if !config.remotes.contains_key(&name) {
                    return Err(CoreError::UnknownRemote { name });
                }
                config.core.remote = Some(name);
            }
            None => config.core.remote = None,
        }
        Ok(())
    })
}

/// `(name, url)` pairs in name order.
pub fn remote_list_at(root: &Path) -> Result<Vec<(String, String)>, CoreError> {
    Ok(load_at(root)?
        .remotes
        .into_iter()
        .map(|(name, remote)| (name, remote.url))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = load_at(tmp.path()).unwrap();
        assert_eq!(config.cache.link_types, LinkType::defaults());
        assert!(config.jobs() >= 4);
    }

    #[test]
    fn link_types_parse_from_type_key() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(paths::dot_dir(tmp.path())).unwrap();
        std::fs::write(
            path_at(tmp.path()),
            "cache:\n  type: [hardlink, symlink]\ncore:\n  jobs: 2\n",
        )
        .unwrap();
        let config = load_at(tmp.path()).unwrap();
        assert_eq!(
            config.cache.link_types,
            vec![LinkType::Hardlink, LinkType::Symlink]
        );
        assert_eq!(config.jobs(), 2);
    }

    #[test]
    fn empty_link_type_list_is_invalid() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(paths::dot_dir(tmp.path())).unwrap();
        std::fs::write(path_at(tmp.path()), "cache:\n  type: []\n").unwrap();
        assert!(matches!(
            load_at(tmp.path()),
            Err(CoreError::Invalid { .. })
        ));
    }

    #[test]
    fn add_default_and_remove_remote() {
        let tmp = TempDir::new().unwrap();
        remote_add_at(tmp.path(), "Storage", "/mnt/bucket", true, false).unwrap();
        let config = load_at(tmp.path()).unwrap();
        assert_eq!(config.core.remote.as_deref(), Some("storage"));
        let (name, remote) = config.resolve_remote(None).unwrap();
        assert_eq!(name, "storage");
        assert_eq!(remote.url, "/mnt/bucket");

        remote_remove_at(tmp.path(), "storage").unwrap();
        let config = load_at(tmp.path()).unwrap();
        assert!(config.core.remote.is_none());
        assert!(matches!(
            config.resolve_remote(None),
            Err(CoreError::NoDefaultRemote)
        ));
    }

    #[test]
    fn duplicate_remote_requires_force() {
        let tmp = TempDir::new().unwrap();
        remote_add_at(tmp.path(), "a", "/one", false, false).unwrap();
        assert!(matches!(
            remote_add_at(tmp.path(), "a", "/two", false, false),
            Err(CoreError::DuplicateRemote { .. })
        ));
        remote_add_at(tmp.path(), "a", "/two", false, true).unwrap();
        assert_eq!(
            remote_list_at(tmp.path()).unwrap(),
            vec![("a".to_string(), "/two".to_string())]
        );
    }

    #[test]
    fn modify_and_default_validation() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            remote_modify_at(tmp.path(), "missing", "user", Some("x")),
            Err(CoreError::UnknownRemote { .. })
        ));
        assert!(matches!(
            remote_default_at(tmp.path(), Some("missing")),
            Err(CoreError::UnknownRemote { .. })
        ));

        remote_add_at(tmp.path(), "a", "/one", false, false).unwrap();
        remote_modify_at(tmp.path(), "a", "region", Some("eu")).unwrap();
        let config = load_at(tmp.path()).unwrap();
        assert_eq!(config.remotes["a"].options["region"], "eu");
        remote_modify_at(tmp.path(), "a", "region", None).unwrap();
        assert!(load_at(tmp.path()).unwrap().remotes["a"].options.is_empty());
        assert!(remote_modify_at(tmp.path(), "a", "url", None).is_err());
    }
}
