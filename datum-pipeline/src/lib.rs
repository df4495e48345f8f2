//! # datum-pipeline
//!
//! The stage dependency graph and the executor that re-runs stale stages.
//!
//! [`StageGraph`] links stages by output/dependency paths and rejects
//! malformed pipelines before anything runs. [`Checker`] decides whether a
//! stage is stale against its lock record; [`Executor`] walks the graph in
//! topological order and reports `{ran, skipped, failed, blocked}`.

pub mod error;
pub mod executor;
pub mod graph;
pub mod params;
pub mod staleness;

use std::path::Path;

use datum_core::{pipeline_file, tracking};

pub use error::StageError;
pub use executor::{Executor, ExecutorOptions, ExecutorResult};
pub use graph::StageGraph;
pub use staleness::{Checker, StageStatus, StaleReason};

/// Load every declared stage of the repository at `root` (pipeline stages in
/// declaration order, then tracking records) and build the graph.
pub fn load_graph_at(root: &Path) -> Result<StageGraph, StageError> {
    let mut stages = pipeline_file::load_at(root)?;
    stages.extend(tracking::load_stages_at(root)?);
    Ok(StageGraph::build(stages)?)
}
