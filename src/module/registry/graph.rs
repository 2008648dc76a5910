//! Load-order dependency graph
//!
//! Edges point from a dependant to its dependency. A dependency that names
//! no known module points at the [`GraphNode::Unresolved`] sentinel, which is
//! never removed: anything with a path to it can never become ready and ends
//! the load loop stamped as a missing dependency.

use petgraph::algo::kosaraju_scc;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use std::collections::{HashMap, HashSet};

use crate::module::registry::descriptor::{ModuleDescriptor, ModuleId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphNode {
    Module(ModuleId),
    /// Stands in for every dependency that does not exist
    Unresolved,
}

/// Graph for one load-loop invocation
#[derive(Debug)]
pub struct DependencyGraph {
    graph: StableDiGraph<GraphNode, ()>,
    nodes: HashMap<ModuleId, NodeIndex>,
    unresolved: NodeIndex,
}

impl DependencyGraph {
    /// Build the graph for a batch of modules to load
    ///
    /// `is_known` says whether a dependency outside the batch exists at all
    /// (for example a module that is already loaded); such dependencies add
    /// no edge and are checked when the dependant is dispatched.
    pub fn build<'a, I, F>(pending: I, is_known: F) -> Self
    where
        I: IntoIterator<Item = &'a ModuleDescriptor>,
        F: Fn(&str) -> bool,
    {
        let mut graph = StableDiGraph::new();
        let unresolved = graph.add_node(GraphNode::Unresolved);
        let descriptors: Vec<&ModuleDescriptor> = pending.into_iter().collect();

        let mut nodes = HashMap::new();
        for descriptor in &descriptors {
            let index = graph.add_node(GraphNode::Module(descriptor.id.clone()));
            nodes.insert(descriptor.id.clone(), index);
        }

        for descriptor in &descriptors {
            let from = nodes[&descriptor.id];
            for dependency in descriptor.dependencies.keys() {
                if let Some(&to) = nodes.get(dependency) {
                    graph.update_edge(from, to, ());
                } else if !is_known(dependency) {
                    graph.update_edge(from, unresolved, ());
                }
            }
        }

        Self {
            graph,
            nodes,
            unresolved,
        }
    }

    /// Modules with no remaining dependency edge, minus those already in flight
    pub fn ready(&self, in_flight: &HashSet<ModuleId>) -> Vec<ModuleId> {
        self.graph
            .node_indices()
            .filter(|&index| index != self.unresolved)
            .filter(|&index| self.graph.neighbors(index).next().is_none())
            .filter_map(|index| match &self.graph[index] {
                GraphNode::Module(id) if !in_flight.contains(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Remove a settled module together with the edges pointing at it
    pub fn settle(&mut self, id: &str) {
        if let Some(index) = self.nodes.remove(id) {
            self.graph.remove_node(index);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Modules still in the graph, in insertion order
    pub fn remaining(&self) -> Vec<ModuleId> {
        self.graph
            .node_indices()
            .filter_map(|index| match &self.graph[index] {
                GraphNode::Module(id) => Some(id.clone()),
                GraphNode::Unresolved => None,
            })
            .collect()
    }

    /// Dependency cycles among the remaining modules
    pub fn cycles(&self) -> Vec<Vec<ModuleId>> {
        kosaraju_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .map(|scc| {
                scc.into_iter()
                    .filter_map(|index| match &self.graph[index] {
                        GraphNode::Module(id) => Some(id.clone()),
                        GraphNode::Unresolved => None,
                    })
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: &str, deps: &[&str]) -> ModuleDescriptor {
        deps.iter()
            .fold(ModuleDescriptor::new(id, id), |d, dep| d.with_dependency(*dep, "*"))
    }

    #[test]
    fn test_ready_set_follows_dependencies() {
        let modules = vec![module("a", &[]), module("b", &["a"]), module("c", &["d"])];
        let mut graph = DependencyGraph::build(&modules, |_| false);

        assert_eq!(graph.ready(&HashSet::new()), vec!["a".to_string()]);

        let in_flight: HashSet<ModuleId> = ["a".to_string()].into_iter().collect();
        assert!(graph.ready(&in_flight).is_empty());

        graph.settle("a");
        assert_eq!(graph.ready(&HashSet::new()), vec!["b".to_string()]);
        graph.settle("b");
        assert!(graph.ready(&HashSet::new()).is_empty());
        assert_eq!(graph.remaining(), vec!["c".to_string()]);
    }

    #[test]
    fn test_known_outside_dependency_adds_no_edge() {
        let modules = vec![module("b", &["a"])];
        let graph = DependencyGraph::build(&modules, |name| name == "a");
        assert_eq!(graph.ready(&HashSet::new()), vec!["b".to_string()]);
    }

    #[test]
    fn test_cycles_are_reported() {
        let modules = vec![
            module("x", &["y"]),
            module("y", &["x"]),
            module("s", &["s"]),
            module("free", &[]),
        ];
        let graph = DependencyGraph::build(&modules, |_| false);
        assert_eq!(graph.ready(&HashSet::new()), vec!["free".to_string()]);

        let mut cycles = graph.cycles();
        for cycle in &mut cycles {
            cycle.sort();
        }
        cycles.sort();
        assert_eq!(
            cycles,
            vec![
                vec!["s".to_string()],
                vec!["x".to_string(), "y".to_string()]
            ]
        );
    }
}
