//! Dependency graph - nodes are declarations, edges are references
//!
//! An edge from A to B means "A must be applied after B" (A consumes one of
//! B's attributes). The graph is validated acyclic on construction, so every
//! method below can assume a topological order exists.

use crate::error::{Error, Result, UnresolvedReason};
use crate::planner::Target;
use crate::reference::{Reference, resolve_references};
use crate::resource::{Configuration, ResourceDeclaration};
use crate::types::ResourceId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;

/// Node color for depth-first cycle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Not yet visited
    Unvisited,
    /// On the current DFS path
    InProgress,
    /// All dependencies explored
    Done,
}

/// Which way [`DependencyGraph::select`] expands a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Keep what the target needs (apply)
    Dependencies,
    /// Keep what needs the target (destroy)
    Dependents,
}

/// An acyclic graph of resource declarations
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<ResourceDeclaration>,
    index: HashMap<ResourceId, usize>,
    /// `dependencies[a]` holds every `b` with an edge a -> b, ascending
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    references: Vec<Reference>,
}

impl DependencyGraph {
    /// Resolve references and build the graph in one step
    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let references = resolve_references(config)?;
        Self::build(config, references)
    }

    /// Assemble the graph from declarations and their resolved references.
    ///
    /// Fails with [`Error::CyclicDependency`] when the references form a
    /// cycle, before anything else can run.
    pub fn build(config: &Configuration, references: Vec<Reference>) -> Result<Self> {
        Self::from_parts(config.declarations().to_vec(), references)
    }

    fn from_parts(nodes: Vec<ResourceDeclaration>, references: Vec<Reference>) -> Result<Self> {
        let index: HashMap<ResourceId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];

        for reference in &references {
            let (Some(&from), Some(&to)) = (index.get(&reference.from), index.get(&reference.to))
            else {
                return Err(Error::UnresolvedReference {
                    from: reference.from.clone(),
                    field: reference.field.clone(),
                    target: reference.to.clone(),
                    attribute: reference.attribute.clone(),
                    reason: UnresolvedReason::UndeclaredResource,
                });
            };
            dependencies[from].push(to);
            dependents[to].push(from);
        }

        for edges in dependencies.iter_mut().chain(dependents.iter_mut()) {
            edges.sort_unstable();
            edges.dedup();
        }

        let graph = Self {
            nodes,
            index,
            dependencies,
            dependents,
            references,
        };
        graph.detect_cycle()?;

        log::debug!(
            "built dependency graph: {} node(s), {} edge(s)",
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    /// Three-color depth-first search; a dependency that is still in
    /// progress closes a cycle.
    ///
    /// Iterative, so deep chains cannot overflow the stack.
    fn detect_cycle(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            // (node, index of the next dependency to explore); this is the DFS path
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::InProgress;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let Some(&next) = self.dependencies[node].get(top.1) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.1 += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::InProgress => {
                        let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut cycle: Vec<ResourceId> = stack[from..]
                            .iter()
                            .map(|&(n, _)| self.nodes[n].id.clone())
                            .collect();
                        cycle.push(self.nodes[next].id.clone());
                        return Err(Error::CyclicDependency { cycle });
                    }
                    Mark::Done => {}
                }
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(Vec::len).sum()
    }

    /// Declarations in declaration order
    pub fn nodes(&self) -> &[ResourceDeclaration] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &ResourceDeclaration {
        &self.nodes[index]
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDeclaration> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub(crate) fn dependency_indices(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    pub(crate) fn dependent_indices(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Direct dependencies of a node (what it must wait for)
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.index_of(id)
            .map(|i| self.ids(&self.dependencies[i]))
            .unwrap_or_default()
    }

    /// Direct dependents of a node (what waits for it)
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.index_of(id)
            .map(|i| self.ids(&self.dependents[i]))
            .unwrap_or_default()
    }

    fn ids(&self, indices: &[usize]) -> Vec<&ResourceId> {
        indices.iter().map(|&i| &self.nodes[i].id).collect()
    }

    /// Kahn's algorithm; ties among ready nodes go to the earliest
    /// declaration, so the order is deterministic.
    pub(crate) fn topological_indices(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        order
    }

    /// Apply order: every node after all of its dependencies
    pub fn topological_order(&self) -> Vec<&ResourceId> {
        self.ids(&self.topological_indices())
    }

    /// Destroy order: exactly the reverse of [`Self::topological_order`]
    pub fn reverse_topological_order(&self) -> Vec<&ResourceId> {
        let mut order = self.topological_indices();
        order.reverse();
        self.ids(&order)
    }

    /// Every node reachable from `roots` following `direction`, roots included
    fn closure(&self, roots: &[usize], direction: Direction) -> Vec<bool> {
        let mut keep = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = roots.to_vec();

        while let Some(node) = stack.pop() {
            if keep[node] {
                continue;
            }
            keep[node] = true;
            let next = match direction {
                Direction::Dependencies => &self.dependencies[node],
                Direction::Dependents => &self.dependents[node],
            };
            stack.extend(next.iter().copied().filter(|&n| !keep[n]));
        }

        keep
    }

    /// Restrict the graph to the nodes matching `target` plus everything
    /// reachable from them in `direction`
    pub fn select(&self, target: &Target, direction: Direction) -> Result<Self> {
        let roots: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| target.matches(&self.nodes[i].id))
            .collect();
        if roots.is_empty() {
            return Err(Error::UnknownTarget(target.to_string()));
        }

        let keep = self.closure(&roots, direction);
        let nodes = self
            .nodes
            .iter()
            .zip(&keep)
            .filter(|&(_, &kept)| kept)
            .map(|(node, _)| node.clone())
            .collect();
        let references = self
            .references
            .iter()
            .filter(|r| {
                let kept = |id: &ResourceId| self.index_of(id).is_some_and(|i| keep[i]);
                kept(&r.from) && kept(&r.to)
            })
            .cloned()
            .collect();

        Self::from_parts(nodes, references)
    }

    /// Graphviz rendering, edges pointing from consumer to producer
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {\n  rankdir = \"RL\";\n");
        for node in &self.nodes {
            let _ = writeln!(out, "  \"{}\";", node.id);
        }
        for (from, deps) in self.dependencies.iter().enumerate() {
            for &to in deps {
                let _ = writeln!(out, "  \"{}\" -> \"{}\";", self.nodes[from].id, self.nodes[to].id);
            }
        }
        out.push_str("}\n");
        out
    }
}
