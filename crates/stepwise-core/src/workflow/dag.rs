//! Step dependency graph: cycle detection, dispatch ordering, and wave planning.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles; the scheduler's frontier ordering (dependency depth,
//! then declaration order) is derived from the same graph.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use stepwise_types::workflow::StepDefinition;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build a directed graph with an edge from each dependency to its dependent.
fn build_graph(
    steps: &[StepDefinition],
) -> Result<(DiGraph<&str, ()>, Vec<NodeIndex>), WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.step_id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps
        .iter()
        .map(|s| graph.add_node(s.step_id.as_str()))
        .collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.step_id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    Ok((graph, node_indices))
}

/// Validate that steps form a DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    let (graph, _) = build_graph(steps)?;
    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Depth and wave planning
// ---------------------------------------------------------------------------

/// Dependency depth per step: roots are 0, others are max(dep depth) + 1.
pub fn step_depths(steps: &[StepDefinition]) -> Result<HashMap<String, usize>, WorkflowError> {
    let (graph, _) = build_graph(steps)?;
    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;

    let by_id: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

    let mut depths: HashMap<String, usize> = HashMap::with_capacity(steps.len());
    for node in sorted {
        let step = by_id[graph[node]];
        let depth = step
            .dependencies
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step.step_id.clone(), depth);
    }
    Ok(depths)
}

/// Group steps into waves of equal depth; every step in a wave only depends on
/// earlier waves. Steps keep declaration order within a wave.
pub fn build_execution_plan(
    steps: &[StepDefinition],
) -> Result<Vec<Vec<&StepDefinition>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }
    let depths = step_depths(steps)?;
    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[&step.step_id]].push(step);
    }
    Ok(waves)
}

/// Step indices sorted by (dependency depth, declaration index).
///
/// The scheduler scans this order when building each dispatch round, which
/// makes dispatch order independent of completion order.
pub fn dispatch_order(steps: &[StepDefinition]) -> Result<Vec<usize>, WorkflowError> {
    let depths = step_depths(steps)?;
    let mut order: Vec<usize> = (0..steps.len()).collect();
    order.sort_by_key(|&i| (depths[&steps[i].step_id], i));
    Ok(order)
}

// ---------------------------------------------------------------------------
// Transitive closures
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given step.
pub fn get_step_dependencies<'a>(step_id: &str, steps: &'a [StepDefinition]) -> Vec<&'a str> {
    let step_map: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.step_id.as_str(), s)).collect();

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack = vec![step_id];

    while let Some(current) = stack.pop() {
        if let Some(step) = step_map.get(current) {
            for dep in &step.dependencies {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    let mut deps: Vec<&str> = visited.into_iter().collect();
    deps.sort_unstable();
    deps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
