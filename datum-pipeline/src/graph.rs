//! The stage dependency graph.
//!
//! Nodes are stages (pipeline stages and tracking records alike). An edge
//! runs from a producer to a consumer when one of the producer's outputs is
//! a dependency of the consumer: either the very same path, or a directory
//! output containing the dependency. The graph is validated when built, so
//! nothing executes against a malformed pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use datum_core::paths;
use datum_core::{Stage, StructuralError};

use crate::error::StageError;

#[derive(Debug)]
pub struct StageGraph {
    stages: Vec<Stage>,
    /// `downstream[i]`: consumers of stage `i`'s outputs.
    downstream: Vec<BTreeSet<usize>>,
    upstream: Vec<BTreeSet<usize>>,
    /// Topological order; producers first, ties in declaration order.
    order: Vec<usize>,
}

impl StageGraph {
    /// Build and validate the graph over `stages` (declaration order).
    pub fn build(stages: Vec<Stage>) -> Result<Self, StructuralError> {
        check_names(&stages)?;
        check_outputs(&stages)?;

        let n = stages.len();
        let mut downstream = vec![BTreeSet::new(); n];
        let mut upstream = vec![BTreeSet::new(); n];
        let outs: Vec<Vec<PathBuf>> = stages.iter().map(Stage::out_paths).collect();
        for (consumer, stage) in stages.iter().enumerate() {
            for dep in stage.dep_paths() {
                for (producer, produced) in outs.iter().enumerate() {
                    if produced.iter().any(|out| out == &dep || paths::is_strict_ancestor(out, &dep)) {
                        downstream[producer].insert(consumer);
                        upstream[consumer].insert(producer);
                    }
                }
            }
        }

        let order = topological_order(&stages, &upstream, &downstream)?;
        Ok(Self {
            stages,
            downstream,
            upstream,
            order,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> &Stage {
        &self.stages[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.index_of(name).map(|i| &self.stages[i])
    }

    /// Stage indices in execution order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Stages in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.order.iter().map(|&i| &self.stages[i])
    }

    /// Direct producers of stage `index`'s dependencies.
    pub fn upstream(&self, index: usize) -> &BTreeSet<usize> {
        &self.upstream[index]
    }

    /// Direct consumers of stage `index`'s outputs.
    pub fn downstream(&self, index: usize) -> &BTreeSet<usize> {
        &self.downstream[index]
    }

    /// Every stage reachable from `index` along producer→consumer edges,
    /// excluding `index` itself.
    pub fn reachable_from(&self, index: usize) -> BTreeSet<usize> {
        closure(index, &self.downstream)
    }

    /// The named stages plus everything upstream of them. An empty list
    /// selects the whole graph.
    pub fn select(&self, names: &[String]) -> Result<BTreeSet<usize>, StageError> {
        if names.is_empty() {
            return Ok((0..self.stages.len()).collect());
        }
        let mut selected = BTreeSet::new();
        for name in names {
            let index = self
                .index_of(name)
                .ok_or_else(|| StageError::UnknownStage { name: name.clone() })?;
            selected.insert(index);
            selected.extend(closure(index, &self.upstream));
        }
        Ok(selected)
    }

    /// The stage owning output `path` (repo-relative), if any. A path inside
    /// a directory output belongs to that output's stage.
    pub fn owner_of(&self, path: &std::path::Path) -> Option<&Stage> {
        let path = paths::normalize(path);
        self.stages.iter().find(|stage| {
            stage
                .out_paths()
                .iter()
                .any(|out| out == &path || paths::is_strict_ancestor(out, &path))
        })
    }
}

fn closure(start: usize, edges: &[BTreeSet<usize>]) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<usize> = edges[start].iter().copied().collect();
    while let Some(next) = stack.pop() {
        if seen.insert(next) {
            stack.extend(edges[next].iter().copied());
        }
    }
    seen.remove(&start);
    seen
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_names(stages: &[Stage]) -> Result<(), StructuralError> {
    let mut seen = BTreeSet::new();
    for stage in stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(StructuralError::DuplicateStage {
                name: stage.name.clone(),
            });
        }
    }
    Ok(())
}

fn check_outputs(stages: &[Stage]) -> Result<(), StructuralError> {
    let mut owners: BTreeMap<PathBuf, &str> = BTreeMap::new();
    for stage in stages {
        for out in stage.out_paths() {
            if let Some(first) = owners.get(&out) {
                return Err(StructuralError::DuplicateOutput {
                    path: out,
                    first: first.to_string(),
                    second: stage.name.clone(),
                });
            }
            owners.insert(out, &stage.name);
        }
    }
    for (parent, parent_stage) in &owners {
        // Descendants sort directly after their ancestor, component-wise.
        let Some((child, child_stage)) = owners.range(parent.clone()..).nth(1) else {
            continue;
        };
        if paths::is_strict_ancestor(parent, child) {
            return Err(StructuralError::OverlappingOutputs {
                parent: parent.clone(),
                parent_stage: parent_stage.to_string(),
                child: child.clone(),
                child_stage: child_stage.to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

fn topological_order(
    stages: &[Stage],
    upstream: &[BTreeSet<usize>],
    downstream: &[BTreeSet<usize>],
) -> Result<Vec<usize>, StructuralError> {
    let mut in_degree: Vec<usize> = upstream.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &consumer in &downstream[next] {
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.insert(consumer);
            }
        }
    }

    if order.len() == stages.len() {
        return Ok(order);
    }
    let remaining: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] > 0).collect();
    Err(StructuralError::Cycle {
        stages: find_cycle(&remaining, upstream)
            .into_iter()
            .map(|i| stages[i].name.clone())
            .collect(),
    })
}

/// Every stage left over by the ordering has a producer that is also left
/// over, so walking producers from any of them must revisit a stage.
fn find_cycle(remaining: &BTreeSet<usize>, upstream: &[BTreeSet<usize>]) -> Vec<usize> {
    let Some(&start) = remaining.first() else {
        return vec![];
    };
    let mut walk = vec![start];
    let mut current = start;
    loop {
        let Some(&producer) = upstream[current].iter().find(|p| remaining.contains(p)) else {
            return walk;
        };
        if let Some(pos) = walk.iter().position(|&s| s == producer) {
            let mut cycle: Vec<usize> = walk[pos..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return cycle;
        }
        walk.push(producer);
        current = producer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_core::{Dependency, Output};
    use rstest::rstest;

    fn stage(name: &str, deps: &[&str], outs: &[&str]) -> Stage {
        let mut stage = Stage::pipeline(name, format!("echo {name}"));
        stage.deps = deps.iter().map(|d| Dependency::new(*d)).collect();
        stage.outs = outs.iter().map(|o| Output::new(*o)).collect();
        stage
    }

    fn names(graph: &StageGraph) -> Vec<&str> {
        graph.ordered().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn producers_run_before_consumers() {
        let graph = StageGraph::build(vec![
            stage("train", &["features.csv"], &["model.bin"]),
            stage("featurize", &["raw.csv"], &["features.csv"]),
            stage("evaluate", &["model.bin"], &["scores.json"]),
        ])
        .unwrap();
        assert_eq!(names(&graph), ["featurize", "train", "evaluate"]);
    }

    #[test]
    fn independent_stages_keep_declaration_order() {
        let graph = StageGraph::build(vec![
            stage("c", &[], &["c.out"]),
            stage("a", &[], &["a.out"]),
            stage("b", &["c.out"], &["b.out"]),
        ])
        .unwrap();
        assert_eq!(names(&graph), ["c", "a", "b"]);
    }

    #[test]
    fn dependency_inside_directory_output_is_an_edge() {
        let graph = StageGraph::build(vec![
            stage("use", &["data/part-0.csv"], &["summary.txt"]),
            stage("split", &[], &["data"]),
        ])
        .unwrap();
        assert_eq!(names(&graph), ["split", "use"]);
    }

    #[rstest]
    #[case("data", "data/file")]
    #[case("data/", "data/file")]
    #[case("./a/b", "a/b/c/d")]
    fn nested_outputs_are_rejected(#[case] parent: &str, #[case] child: &str) {
        let err = StageGraph::build(vec![
            stage("a", &[], &[parent]),
            stage("b", &[], &[child]),
        ])
        .unwrap_err();
        assert!(matches!(err, StructuralError::OverlappingOutputs { .. }), "{err}");
    }

    #[test]
    fn sibling_prefix_is_not_overlap() {
        StageGraph::build(vec![
            stage("a", &[], &["data"]),
            stage("b", &[], &["data-v2/file"]),
            stage("c", &[], &["data.csv"]),
        ])
        .unwrap();
    }

    #[test]
    fn duplicate_output_names_both_owners() {
        let err = StageGraph::build(vec![
            stage("a", &[], &["model.bin"]),
            stage("b", &[], &["model.bin"]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            StructuralError::DuplicateOutput {
                path: "model.bin".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn cycle_is_named() {
        let err = StageGraph::build(vec![
            stage("head", &[], &["seed"]),
            stage("a", &["seed", "b.out"], &["a.out"]),
            stage("b", &["a.out"], &["b.out"]),
        ])
        .unwrap_err();
        let StructuralError::Cycle { stages } = err else {
            panic!("expected a cycle");
        };
        assert_eq!(stages.first(), stages.last());
        assert!(stages.contains(&"a".to_string()) && stages.contains(&"b".to_string()));
        assert!(!stages.contains(&"head".to_string()));
    }

    #[test]
    fn selection_includes_upstream_only() {
        let graph = StageGraph::build(vec![
            stage("a", &[], &["a.out"]),
            stage("b", &["a.out"], &["b.out"]),
            stage("c", &["b.out"], &["c.out"]),
            stage("d", &[], &["d.out"]),
        ])
        .unwrap();
        let selected = graph.select(&["b".to_string()]).unwrap();
        assert_eq!(selected, BTreeSet::from([0, 1]));
        assert_eq!(graph.reachable_from(0), BTreeSet::from([1, 2]));
        assert!(matches!(
            graph.select(&["nope".to_string()]),
            Err(StageError::UnknownStage { .. })
        ));
    }

    #[test]
    fn owner_lookup_descends_into_directory_outputs() {
        let graph = StageGraph::build(vec![stage("split", &[], &["data"])]).unwrap();
        assert_eq!(graph.owner_of("data/x.csv".as_ref()).unwrap().name, "split");
        assert!(graph.owner_of("other".as_ref()).is_none());
    }
}
