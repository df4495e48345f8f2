//! End-to-end pipeline runs over real shell commands.
#![cfg(unix)]

use std::collections::BTreeSet;
use std::path::Path;

use tempfile::TempDir;

use datum_cache::{CacheStore, Hasher, StateTable};
use datum_core::{lockfile, paths, pipeline_file, Dependency, LinkType, Output, Stage, StructuralError};
use datum_pipeline::{load_graph_at, Checker, Executor, ExecutorOptions, ExecutorResult, StageError};

struct Repo {
    tmp: TempDir,
    cache: CacheStore,
    hasher: Hasher,
}

impl Repo {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::at_repo(tmp.path(), vec![LinkType::Copy]);
        let hasher = Hasher::new(StateTable::empty(paths::state_path(tmp.path())));
        Self { tmp, cache, hasher }
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.root().join(rel);
        // Outputs are committed read-only; replace rather than edit in place.
        let _ = std::fs::remove_file(&path);
        std::fs::write(path, contents).unwrap();
    }

    fn declare(&self, stages: &[Stage]) {
        pipeline_file::save_at(self.root(), stages).unwrap();
    }

    fn repro(&self) -> ExecutorResult {
        let graph = load_graph_at(self.root()).unwrap();
        let selected = graph.select(&[]).unwrap();
        Executor::new(self.root(), &self.cache, &self.hasher, ExecutorOptions::default())
            .run(&graph, &selected)
            .unwrap()
    }

    fn stale(&self) -> BTreeSet<String> {
        let graph = load_graph_at(self.root()).unwrap();
        let lock = lockfile::load_at(self.root()).unwrap();
        let checker = Checker::new(self.root(), &self.cache, &self.hasher);
        graph
            .ordered()
            .filter(|s| checker.check(s, lock.get(&s.name)).unwrap().is_stale())
            .map(|s| s.name.clone())
            .collect()
    }
}

fn stage(name: &str, cmd: &str, deps: &[&str], outs: &[&str]) -> Stage {
    let mut stage = Stage::pipeline(name, cmd);
    stage.deps = deps.iter().map(|d| Dependency::new(*d)).collect();
    stage.outs = outs.iter().map(|o| Output::new(*o)).collect();
    stage
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn failure_blocks_only_downstream_stages() {
    let repo = Repo::new();
    repo.write("seed.txt", "1");
    repo.declare(&[
        stage("a", "cp seed.txt a.txt", &["seed.txt"], &["a.txt"]),
        stage("b", "exit 3", &["a.txt"], &["b.txt"]),
        stage("c", "cp b.txt c.txt", &["b.txt"], &["c.txt"]),
        stage("d", "echo d > d.txt", &[], &["d.txt"]),
    ]);

    let result = repo.repro();
    assert_eq!(result.ran, ["a", "d"]);
    assert_eq!(result.failed_names(), ["b"]);
    assert!(matches!(result.failed[0].1, StageError::CommandFailed { .. }));
    assert_eq!(result.blocked, ["c"]);

    let lock = lockfile::load_at(repo.root()).unwrap();
    assert!(lock.contains_key("a"));
    assert!(!lock.contains_key("b"));
    assert!(!lock.contains_key("c"));
    assert!(!repo.root().join("c.txt").exists());
}

#[test]
fn modified_output_marks_it_and_its_consumers_stale() {
    let repo = Repo::new();
    repo.write("raw.txt", "raw");
    repo.declare(&[
        stage("a", "cat raw.txt > a.txt", &["raw.txt"], &["a.txt"]),
        stage("b", "cat a.txt a.txt > b.txt", &["a.txt"], &["b.txt"]),
        stage("d", "echo independent > d.txt", &[], &["d.txt"]),
    ]);
    assert!(repo.repro().is_success());
    assert!(repo.stale().is_empty());

    repo.write("a.txt", "tampered");
    assert_eq!(repo.stale(), set(&["a", "b"]));

    // Re-running a restores the bytes b was built from, so b is current again
    // by the time it is reached.
    let result = repo.repro();
    assert_eq!(result.ran, ["a"]);
    assert_eq!(result.skipped, ["b", "d"]);
    assert_eq!(std::fs::read_to_string(repo.root().join("b.txt")).unwrap(), "rawraw");

    repo.write("raw.txt", "new");
    let result = repo.repro();
    assert_eq!(result.ran, ["a", "b"]);
    assert_eq!(result.skipped, ["d"]);
    assert_eq!(std::fs::read_to_string(repo.root().join("b.txt")).unwrap(), "newnew");
}

#[test]
fn overlapping_outputs_fail_before_anything_runs() {
    let repo = Repo::new();
    repo.declare(&[
        stage("a", "touch ran-a", &[], &["data/"]),
        stage("b", "touch ran-b", &[], &["data/file"]),
    ]);
    let err = load_graph_at(repo.root()).unwrap_err();
    assert!(matches!(
        err,
        StageError::Structural(StructuralError::OverlappingOutputs { .. })
    ));
    assert!(!repo.root().join("ran-a").exists());
    assert!(!repo.root().join("ran-b").exists());
}

#[test]
fn tracked_data_feeds_pipeline_stages() {
    let repo = Repo::new();
    std::fs::create_dir_all(repo.root().join("data")).unwrap();
    repo.write("data/rows.csv", "a,b\n");
    let id = datum_cache::commit(&repo.cache, &repo.hasher, &repo.root().join("data")).unwrap().id;
    datum_core::tracking::save(
        &repo.root().join("data.datum"),
        &datum_core::tracking::TrackingRecord::single("data", id),
    )
    .unwrap();
    repo.declare(&[stage("count", "wc -l < data/rows.csv > count.txt", &["data/rows.csv"], &["count.txt"])]);

    let graph = load_graph_at(repo.root()).unwrap();
    let names: Vec<&str> = graph.ordered().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["data.datum", "count"]);

    let result = repo.repro();
    assert_eq!(result.ran, ["count"]);
    assert!(result.skipped.is_empty());
}
