//! Ordered, partial-failure-tolerant pipeline execution.
//!
//! Stages run one at a time in topological order. A stale stage has its
//! non-persistent outputs removed, its command run through the shell from
//! its working directory, and on success its outputs committed to the cache
//! and its lock record rewritten. A failed stage keeps its old lock record
//! and blocks everything downstream of it; unrelated stages keep running.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use datum_cache::{commit, CacheStore, Hasher};
use datum_core::error::io_err;
use datum_core::lockfile::{self, LockFile, LockRecord, PathChecksum};
use datum_core::{Interrupt, Stage};

use crate::error::StageError;
use crate::graph::StageGraph;
use crate::params;
use crate::staleness::{Checker, StageStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Run selected stages even when they are up to date. Frozen stages are
    /// still skipped.
    pub force: bool,
    pub interrupt: Interrupt,
}

/// Outcome of one pipeline run, stage names in execution order.
#[derive(Debug, Default)]
pub struct ExecutorResult {
    pub ran: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, StageError)>,
    /// Not attempted because an upstream stage failed or the run was
    /// interrupted.
    pub blocked: Vec<String>,
}

impl ExecutorResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|(name, _)| name.as_str()).collect()
    }
}

pub struct Executor<'a> {
    root: &'a Path,
    cache: &'a CacheStore,
    hasher: &'a Hasher,
    opts: ExecutorOptions,
}

impl<'a> Executor<'a> {
    pub fn new(root: &'a Path, cache: &'a CacheStore, hasher: &'a Hasher, opts: ExecutorOptions) -> Self {
        Self {
            root,
            cache,
            hasher,
            opts,
        }
    }

    /// Execute the `selected` stage indices of `graph`.
    pub fn run(&self, graph: &StageGraph, selected: &BTreeSet<usize>) -> Result<ExecutorResult, StageError> {
        let mut lock = lockfile::load_at(self.root)?;
        let checker = Checker::new(self.root, self.cache, self.hasher);
        let mut result = ExecutorResult::default();
        let mut blocked = BTreeSet::new();

        for &index in graph.order().iter().filter(|i| selected.contains(i)) {
            let stage = graph.stage(index);
            // Tracking records describe data, they never execute.
            if stage.is_tracking() {
                continue;
            }
            if blocked.contains(&index) || self.opts.interrupt.is_triggered() {
                tracing::warn!("stage '{}' blocked", stage.name);
                result.blocked.push(stage.name.clone());
                continue;
            }

            let status = match checker.check(stage, lock.get(&stage.name)) {
                Ok(status) => status,
                Err(err) => {
                    self.fail(graph, index, err, &mut result, &mut blocked);
                    continue;
                }
            };
            let run = match status {
                StageStatus::Frozen => false,
                StageStatus::Stale { reason } => {
                    tracing::info!("stage '{}' is stale: {reason}", stage.name);
                    true
                }
                StageStatus::Current => self.opts.force,
            };
            if !run {
                tracing::debug!("stage '{}' didn't change, skipping", stage.name);
                result.skipped.push(stage.name.clone());
                continue;
            }

            match self.run_stage(stage) {
                Ok(record) => {
                    lock.insert(stage.name.clone(), record);
                    self.save_lock(&lock)?;
                    result.ran.push(stage.name.clone());
                }
                Err(err) => self.fail(graph, index, err, &mut result, &mut blocked),
            }
        }

        self.hasher.save()?;
        Ok(result)
    }

    fn fail(
        &self,
        graph: &StageGraph,
        index: usize,
        err: StageError,
        result: &mut ExecutorResult,
        blocked: &mut BTreeSet<usize>,
    ) {
        let name = graph.stage(index).name.clone();
        tracing::error!("stage '{name}' failed: {err}");
        blocked.extend(graph.reachable_from(index));
        result.failed.push((name, err));
    }

    fn save_lock(&self, lock: &LockFile) -> Result<(), StageError> {
        lockfile::save_at(self.root, lock)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // One stage
    // -----------------------------------------------------------------------

    fn run_stage(&self, stage: &Stage) -> Result<LockRecord, StageError> {
        let cmd = stage.cmd.clone().unwrap_or_default();
        let param_values = params::required_values(self.root, stage)?;
        for dep in &stage.deps {
            let path = self.root.join(stage.resolve(&dep.path));
            if std::fs::symlink_metadata(&path).is_err() {
                return Err(StageError::DependencyMissing {
                    stage: stage.name.clone(),
                    path: dep.path.clone(),
                });
            }
        }
        for out in stage.outs.iter().filter(|o| !o.persist) {
            remove_output(&self.root.join(stage.resolve(&out.path)))?;
        }

        let workdir = self.root.join(&stage.wdir);
        tracing::info!("running stage '{}': {cmd}", stage.name);
        let status = self.run_command(stage, &cmd, &workdir)?;
        if !status.success() {
            return Err(StageError::CommandFailed {
                stage: stage.name.clone(),
                status: describe(status),
            });
        }

        let mut deps = Vec::with_capacity(stage.deps.len());
        for dep in &stage.deps {
            let path = self.root.join(stage.resolve(&dep.path));
            deps.push(PathChecksum {
                path: dep.path.clone(),
                checksum: self.hasher.hash(&path)?.into_id(),
            });
        }

        let mut outs = Vec::with_capacity(stage.outs.len());
        for out in &stage.outs {
            let path = self.root.join(stage.resolve(&out.path));
            if std::fs::symlink_metadata(&path).is_err() {
                return Err(StageError::OutputMissing {
                    stage: stage.name.clone(),
                    path: out.path.clone(),
                });
            }
            let checksum = if !out.cache {
                self.hasher.hash(&path)?.into_id()
            } else if out.persist {
                // The next run appends to it in place.
                commit::store_only(self.cache, self.hasher, &path)?
            } else {
                commit(self.cache, self.hasher, &path)?.id
            };
            outs.push(PathChecksum {
                path: out.path.clone(),
                checksum,
            });
        }

        Ok(LockRecord {
            cmd,
            deps,
            params: param_values,
            outs,
        })
    }

    fn run_command(&self, stage: &Stage, cmd: &str, workdir: &Path) -> Result<ExitStatus, StageError> {
        let mut child = shell(cmd)
            .current_dir(workdir)
            .spawn()
            .map_err(|source| StageError::Spawn {
                stage: stage.name.clone(),
                source,
            })?;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    return Err(StageError::Spawn {
                        stage: stage.name.clone(),
                        source,
                    })
                }
            }
            if self.opts.interrupt.is_triggered() {
                tracing::warn!("terminating stage '{}'", stage.name);
                terminate(&mut child);
                let _ = child.wait();
                return Err(StageError::Interrupted {
                    stage: stage.name.clone(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(unix)]
fn shell(cmd: &str) -> Command {
    use std::os::unix::process::CommandExt;
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd).process_group(0);
    command
}

#[cfg(not(unix))]
fn shell(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}

/// Stop the command and everything it spawned.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        tracing::warn!("failed to signal process group {}: {err}", child.id());
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn remove_output(path: &Path) -> Result<(), StageError> {
    let removed = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => Err(err),
    };
    removed.map_err(|e| io_err(path, e))?;
    tracing::debug!("removed {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_cache::{hasher, StateTable};
    use datum_core::{Dependency, LinkType, Output};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        cache: CacheStore,
        hasher: Hasher,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let cache = CacheStore::new(tmp.path().join(".datum/cache"), vec![LinkType::Copy]);
            let hasher = Hasher::new(StateTable::empty(tmp.path().join(".datum/tmp/state.json")));
            Self { tmp, cache, hasher }
        }

        fn root(&self) -> &Path {
            self.tmp.path()
        }

        fn run(&self, stages: Vec<Stage>, opts: ExecutorOptions) -> ExecutorResult {
            let graph = StageGraph::build(stages).unwrap();
            let all = graph.select(&[]).unwrap();
            Executor::new(self.root(), &self.cache, &self.hasher, opts)
                .run(&graph, &all)
                .unwrap()
        }
    }

    fn stage(name: &str, cmd: &str, deps: &[&str], outs: &[&str]) -> Stage {
        let mut stage = Stage::pipeline(name, cmd);
        stage.deps = deps.iter().map(|d| Dependency::new(*d)).collect();
        stage.outs = outs.iter().map(|o| Output::new(*o)).collect();
        stage
    }

    #[cfg(unix)]
    #[test]
    fn successful_stage_is_cached_and_locked() {
        let f = Fixture::new();
        std::fs::write(f.root().join("in.txt"), "hello").unwrap();
        let stages = vec![stage("upper", "tr a-z A-Z < in.txt > out.txt", &["in.txt"], &["out.txt"])];

        let result = f.run(stages.clone(), ExecutorOptions::default());
        assert_eq!(result.ran, ["upper"]);
        assert_eq!(std::fs::read_to_string(f.root().join("out.txt")).unwrap(), "HELLO");

        let lock = lockfile::load_at(f.root()).unwrap();
        let out = lock["upper"].out_checksum(Path::new("out.txt")).unwrap();
        assert_eq!(out, &hasher::digest_bytes(b"HELLO"));
        assert!(f.cache.has(out));

        let again = f.run(stages, ExecutorOptions::default());
        assert!(again.ran.is_empty());
        assert_eq!(again.skipped, ["upper"]);
    }

    #[cfg(unix)]
    #[test]
    fn missing_declared_output_fails_the_stage() {
        let f = Fixture::new();
        let result = f.run(
            vec![stage("lazy", "true", &[], &["never.txt"])],
            ExecutorOptions::default(),
        );
        assert!(matches!(
            result.failed[0].1,
            StageError::OutputMissing { .. }
        ));
        assert!(lockfile::load_at(f.root()).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn persistent_output_survives_rerun() {
        let f = Fixture::new();
        let mut appender = stage("log", "echo run >> log.txt", &[], &[]);
        appender.outs = vec![Output {
            persist: true,
            ..Output::new("log.txt")
        }];
        appender.always_changed = true;
        f.run(vec![appender.clone()], ExecutorOptions::default());
        f.run(vec![appender], ExecutorOptions::default());
        assert_eq!(
            std::fs::read_to_string(f.root().join("log.txt")).unwrap(),
            "run\nrun\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_terminates_the_running_command() {
        let f = Fixture::new();
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            trigger.trigger();
        });
        let started = std::time::Instant::now();
        let result = f.run(
            vec![
                stage("slow", "sleep 30", &[], &[]),
                stage("later", "true", &[], &[]),
            ],
            ExecutorOptions {
                interrupt,
                ..Default::default()
            },
        );
        waker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(matches!(result.failed[0].1, StageError::Interrupted { .. }));
        assert_eq!(result.blocked, ["later"]);
        assert!(lockfile::load_at(f.root()).unwrap().is_empty());
    }
}
