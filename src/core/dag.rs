//! Step DAG (Directed Acyclic Graph) for execution plans.
//!
//! This module provides the StepDAG structure that represents dependencies
//! between plan steps, and layers them into groups whose members may run
//! concurrently.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The step dependency graph.
///
/// Nodes are step ids; an edge `a -> b` means `b` must observe the
/// terminal state of `a` before it starts.
#[derive(Debug, Default)]
pub struct StepDAG {
    /// The underlying directed graph.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    index: HashMap<TaskId, NodeIndex>,
}

impl StepDAG {
    /// Create a new empty StepDAG.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step to the DAG.
    ///
    /// If the step already exists, returns the existing NodeIndex.
    pub fn add_step(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must finish before `to` starts.
    ///
    /// # Errors
    /// Returns an error if either step is unknown or the edge would
    /// create a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .index
            .get(from)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", from)))?;
        let to_index = *self
            .index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from.short(),
                to.short()
            )));
        }
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Partition steps into layers by longest dependency path.
    ///
    /// Every step in layer `n` depends only on steps in layers `< n`, so the
    /// members of one layer may run concurrently. Within a layer, steps keep
    /// their insertion order.
    pub fn layers(&self) -> Result<Vec<Vec<TaskId>>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph.node_weight(cycle.node_id()).copied().unwrap_or_default();
            Error::Validation(format!("Plan contains a cycle through step {}", id.short()))
        })?;

        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for index in &order {
            let level = self
                .graph
                .neighbors_directed(*index, Direction::Incoming)
                .filter_map(|n| depth.get(&n))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*index, level);
        }

        let layer_count = depth.values().max().map(|d| d + 1).unwrap_or(0);
        let mut layers: Vec<Vec<TaskId>> = vec![Vec::new(); layer_count];
        for index in self.graph.node_indices() {
            if let (Some(level), Some(id)) = (depth.get(&index), self.graph.node_weight(index)) {
                layers[*level].push(*id);
            }
        }
        Ok(layers)
    }
}
