// ABOUTME: Step dependency graph built with petgraph
// ABOUTME: Stable topological ordering, cycle reporting, and implicit input derivation

use crate::error::{Result, RunnerError};
use osiris_core::{DriverRegistry, InputRef, Manifest, Step};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Dependency graph whose node indices follow manifest order
pub struct StepGraph {
    graph: DiGraph<String, ()>,
}

impl StepGraph {
    pub fn build(manifest: &Manifest) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();

        for step in &manifest.steps {
            let idx = graph.add_node(step.id.clone());
            node_map.insert(step.id.as_str(), idx);
        }

        // Edges run from dependency to dependent
        for step in &manifest.steps {
            let to = node_map[step.id.as_str()];
            for need in &step.needs {
                let from = node_map.get(need.as_str()).copied().ok_or_else(|| {
                    RunnerError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: need.clone(),
                    }
                })?;
                graph.add_edge(from, to, ());
            }
        }

        Ok(Self { graph })
    }

    /// Kahn's algorithm; among ready steps the earliest in the manifest runs first
    pub fn topological_order(&self) -> Result<Vec<String>> {
        if is_cyclic_directed(&self.graph) {
            return Err(RunnerError::CycleDetected(self.find_cycle()));
        }

        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = ready.pop_first() {
            order.push(self.graph[node].clone());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.insert(next);
                }
            }
        }

        Ok(order)
    }

    /// One cycle path, closed by repeating its first step
    fn find_cycle(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for node in self.graph.node_indices() {
            if visited.contains(&node) {
                continue;
            }
            if let Some(cycle) = self.cycle_dfs(node, &mut visited, &mut stack) {
                return cycle;
            }
        }
        Vec::new()
    }

    fn cycle_dfs(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);

        for neighbor in self.graph.neighbors(node) {
            if let Some(start) = stack.iter().position(|&n| n == neighbor) {
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|&n| self.graph[n].clone()).collect();
                cycle.push(self.graph[neighbor].clone());
                return Some(cycle);
            }
            if !visited.contains(&neighbor) {
                if let Some(cycle) = self.cycle_dfs(neighbor, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }
}

/// Topological order of the manifest's steps
pub fn topological_order(manifest: &Manifest) -> Result<Vec<String>> {
    StepGraph::build(manifest)?.topological_order()
}

/// Input references for a step from its table-producing dependencies.
///
/// A single upstream table arrives as `df`; several arrive as `df_<step_id>`.
/// Writers are skipped since they emit no table.
pub fn derive_inputs(
    step: &Step,
    manifest: &Manifest,
    registry: &DriverRegistry,
) -> BTreeMap<String, InputRef> {
    let producers: Vec<&str> = step
        .needs
        .iter()
        .filter_map(|need| manifest.step(need))
        .filter(|upstream| registry.role_of(&upstream.driver).produces_table())
        .map(|upstream| upstream.id.as_str())
        .collect();

    match producers.as_slice() {
        [] => BTreeMap::new(),
        [only] => BTreeMap::from([("df".to_string(), InputRef::new(*only, "df"))]),
        many => many
            .iter()
            .map(|id| (format!("df_{}", id), InputRef::new(*id, "df")))
            .collect(),
    }
}
