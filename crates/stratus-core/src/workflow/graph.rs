//! Dependency graph construction and validation for workflow steps.
//!
//! Provides DAG (Directed Acyclic Graph) functionality for step dependencies,
//! including cycle detection, topological sorting, and execution level calculation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;

use crate::error::ValidationError;
use crate::workflow::definition::WorkflowDefinition;

/// Dependency graph for workflow steps.
///
/// Edges point from a dependency to its dependent, so a topological order is
/// a valid execution order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// The underlying graph structure.
    graph: DiGraph<String, ()>,

    /// Mapping from step ID to node index.
    node_map: HashMap<String, NodeIndex>,

    /// Step IDs in topological order.
    order: Vec<String>,
}

impl DependencyGraph {
    /// Creates a new dependency graph from a workflow definition.
    ///
    /// # Errors
    /// Returns error if:
    /// - A dependency reference doesn't exist
    /// - A circular dependency is detected
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        // First pass: create nodes for all steps
        for step in &definition.steps {
            let node = graph.add_node(step.step_id.clone());
            node_map.insert(step.step_id.clone(), node);
        }

        // Second pass: create edges for dependencies and validate references
        for step in &definition.steps {
            let to_node = node_map[&step.step_id];
            for dep_id in &step.depends_on {
                let from_node = node_map.get(dep_id).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        step_id: step.step_id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;
                graph.add_edge(*from_node, to_node, ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(ValidationError::CycleDetected(Self::find_cycle_path(&graph)));
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| {
                ValidationError::CycleDetected(graph[cycle.node_id()].clone())
            })?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self { graph, node_map, order })
    }

    /// Finds a cycle path in the graph for error reporting.
    fn find_cycle_path(graph: &DiGraph<String, ()>) -> String {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for node in graph.node_indices() {
            if !visited.contains(&node)
                && Self::dfs_cycle(graph, node, &mut visited, &mut on_stack, &mut path)
            {
                // Trim the lead-in so the path starts where the cycle closes.
                let closing = path.last().copied();
                let start = path.iter().position(|n| Some(*n) == closing).unwrap_or(0);
                return path[start..]
                    .iter()
                    .map(|idx| graph[*idx].as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ");
            }
        }

        "unknown cycle".to_string()
    }

    /// DFS helper to detect cycles.
    fn dfs_cycle(
        graph: &DiGraph<String, ()>,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        for neighbor in graph.neighbors_directed(node, Direction::Outgoing) {
            if on_stack.contains(&neighbor) {
                path.push(neighbor);
                return true;
            }
            if !visited.contains(&neighbor)
                && Self::dfs_cycle(graph, neighbor, visited, on_stack, path)
            {
                return true;
            }
        }

        on_stack.remove(&node);
        path.pop();
        false
    }

    /// Step IDs in an order where all dependencies come before dependents.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Calculates execution levels for parallel scheduling.
    ///
    /// Steps with no dependencies are at level 0; every other step sits one
    /// level above its deepest dependency.
    pub fn execution_levels(&self) -> BTreeMap<String, u32> {
        let mut levels: BTreeMap<String, u32> = BTreeMap::new();
        for step_id in &self.order {
            let level = self
                .dependencies(step_id)
                .iter()
                .filter_map(|dep| levels.get(dep))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);
            levels.insert(step_id.clone(), level);
        }
        levels
    }

    /// Direct dependencies of `step_id`.
    pub fn dependencies(&self, step_id: &str) -> BTreeSet<String> {
        self.neighbors(step_id, Direction::Incoming)
    }

    /// Direct dependents of `step_id`.
    pub fn dependents(&self, step_id: &str) -> BTreeSet<String> {
        self.neighbors(step_id, Direction::Outgoing)
    }

    /// Every step that depends on `step_id`, directly or transitively.
    pub fn transitive_dependents(&self, step_id: &str) -> BTreeSet<String> {
        let Some(&start) = self.node_map.get(step_id) else {
            return BTreeSet::new();
        };

        let mut reached = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                reached.insert(self.graph[node].clone());
            }
        }
        reached
    }

    /// Steps, in topological order, that are not yet `settled` and whose
    /// dependencies are all in `completed`.
    pub fn ready_steps(
        &self,
        completed: &BTreeSet<String>,
        settled: &dyn Fn(&str) -> bool,
    ) -> Vec<String> {
        self.order
            .iter()
            .filter(|step_id| !settled(step_id))
            .filter(|step_id| self.dependencies(step_id).iter().all(|dep| completed.contains(dep)))
            .cloned()
            .collect()
    }

    /// Gets the number of nodes (steps) in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Gets the number of edges (dependencies) in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn neighbors(&self, step_id: &str, direction: Direction) -> BTreeSet<String> {
        self.node_map.get(step_id).map_or_else(BTreeSet::new, |&node| {
            self.graph
                .neighbors_directed(node, direction)
                .map(|idx| self.graph[idx].clone())
                .collect()
        })
    }
}
