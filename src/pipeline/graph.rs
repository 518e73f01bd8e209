//! Dependency graph over registered components.
//!
//! The graph validates structure at registration time (unknown
//! dependencies, duplicates, cycles) and produces the stable topological
//! order the scheduler runs in: components are grouped by dependency level
//! and sorted alphabetically within each level.

use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};

/// Index into the component list.
pub type NodeIndex = usize;

/// A validated directed acyclic graph of component names.
#[derive(Debug)]
pub struct ComponentGraph {
    names: Vec<String>,
    index_map: HashMap<String, NodeIndex>,
    /// index -> components that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// index -> components it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl ComponentGraph {
    /// Build and validate a graph from `(name, dependencies)` pairs.
    pub fn build(nodes: &[(String, Vec<String>)]) -> Result<Self> {
        let mut index_map = HashMap::new();
        for (i, (name, _)) in nodes.iter().enumerate() {
            if index_map.insert(name.clone(), i).is_some() {
                bail!("duplicate component name: {name}");
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        for (to, (name, deps)) in nodes.iter().enumerate() {
            for dep in deps {
                let Some(&from) = index_map.get(dep) else {
                    bail!("component '{name}' depends on unknown component '{dep}'");
                };
                forward_edges[from].push(to);
                reverse_edges[to].push(from);
            }
        }

        let graph = Self {
            names: nodes.iter().map(|(name, _)| name.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.validate_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.index_map.get(name).copied()
    }

    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// The stable topological order: Kahn's algorithm, taking every ready
    /// node level by level and sorting each level alphabetically.
    pub fn execution_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut done: HashSet<NodeIndex> = HashSet::new();
        let mut order = Vec::with_capacity(self.len());

        while done.len() < self.len() {
            let mut level: Vec<NodeIndex> = (0..self.len())
                .filter(|i| !done.contains(i) && in_degree[*i] == 0)
                .collect();
            if level.is_empty() {
                // Unreachable for a validated graph.
                break;
            }
            level.sort_by(|&a, &b| self.names[a].cmp(&self.names[b]));
            for index in level {
                done.insert(index);
                order.push(self.names[index].clone());
                for &dependent in self.dependents(index) {
                    in_degree[dependent] -= 1;
                }
            }
        }
        order
    }

    /// Cycle check via Kahn's algorithm; names the offending components.
    fn validate_acyclic(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let cycle_members: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.names[i].as_str())
                .collect();
            bail!("dependency cycle detected among components: {cycle_members:?}");
        }
        Ok(())
    }
}
