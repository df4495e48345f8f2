//! Repository layout and path helpers.

use std::path::{Component, Path, PathBuf};

pub const DOT_DIR: &str = ".datum";
pub const PIPELINE_FILE: &str = "datum.yaml";
pub const LOCK_FILE: &str = "datum.lock";
pub const TRACKING_SUFFIX: &str = ".datum";
pub const DEFAULT_PARAMS_FILE: &str = "params.yaml";

pub fn dot_dir(root: &Path) -> PathBuf {
    root.join(DOT_DIR)
}

pub fn cache_dir(root: &Path) -> PathBuf {
    dot_dir(root).join("cache")
}

pub fn tmp_dir(root: &Path) -> PathBuf {
    dot_dir(root).join("tmp")
}

pub fn state_path(root: &Path) -> PathBuf {
    tmp_dir(root).join("state.json")
}

pub fn repo_lock_path(root: &Path) -> PathBuf {
    tmp_dir(root).join("repo.lock")
}

pub fn config_path(root: &Path) -> PathBuf {
    dot_dir(root).join("config.yaml")
}

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component. Never touches the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let climbs = matches!(out.components().next_back(), None | Some(Component::ParentDir));
                if climbs || !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `true` when `ancestor` is a strict ancestor directory of `path`
/// (both normalized, repo-relative).
pub fn is_strict_ancestor(ancestor: &Path, path: &Path) -> bool {
    ancestor != path && path.starts_with(ancestor)
}

/// Render a relative path with `/` separators, as stored in records and
/// directory objects.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("./x")), PathBuf::from("x"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize(Path::new("../../x")), PathBuf::from("../../x"));
    }

    #[rstest]
    #[case("data", "data/file", true)]
    #[case("data", "data/a/b", true)]
    #[case("data", "data", false)]
    #[case("dat", "data/file", false)]
    #[case("data/file", "data", false)]
    fn ancestor_is_component_wise(#[case] ancestor: &str, #[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_strict_ancestor(Path::new(ancestor), Path::new(path)), expected);
    }

    #[test]
    fn posix_rendering() {
        assert_eq!(to_posix(&Path::new("a").join("b").join("c")), "a/b/c");
    }
}
