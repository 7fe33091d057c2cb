//! The file dependency graph.
//!
//! Nodes are source files identified by absolute path, an edge points from a
//! dependent to the file it depends on. Dependents are never stored, they are
//! derived on demand by walking edges backwards. The graph outlives a single
//! process: it is persisted into the compile cache as a [`GraphSnapshot`]
//! after every compile and restored when the compiler starts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

/// A read-only view of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub path: Utf8PathBuf,
    /// Files this node depends on.
    pub dependencies: BTreeSet<Utf8PathBuf>,
    /// Files that depend on this node directly.
    pub dependents: BTreeSet<Utf8PathBuf>,
}

/// Serialized form of the graph, including the reverse index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<Utf8PathBuf, SnapshotNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    #[serde(default)]
    pub dependencies: BTreeSet<Utf8PathBuf>,
    #[serde(default)]
    pub dependents: BTreeSet<Utf8PathBuf>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<Utf8PathBuf, ()>,
    index: HashMap<Utf8PathBuf, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, path: impl AsRef<Utf8Path>) -> bool {
        self.index.contains_key(path.as_ref())
    }

    /// Insert a node if it's not there yet.
    pub fn upsert_node(&mut self, path: impl AsRef<Utf8Path>) -> NodeIndex {
        let path = path.as_ref();
        if let Some(&index) = self.index.get(path) {
            return index;
        }

        let index = self.graph.add_node(path.to_owned());
        self.index.insert(path.to_owned(), index);
        index
    }

    /// Record that `dependent` depends on `dependency`, creating both nodes.
    pub fn add_edge(&mut self, dependent: impl AsRef<Utf8Path>, dependency: impl AsRef<Utf8Path>) {
        let (dependent, dependency) = (dependent.as_ref(), dependency.as_ref());
        if dependent == dependency {
            return;
        }

        let a = self.upsert_node(dependent);
        let b = self.upsert_node(dependency);
        self.graph.update_edge(a, b, ());
    }

    pub fn remove_edge(
        &mut self,
        dependent: impl AsRef<Utf8Path>,
        dependency: impl AsRef<Utf8Path>,
    ) -> bool {
        let a = self.index.get(dependent.as_ref()).copied();
        let b = self.index.get(dependency.as_ref()).copied();
        let (Some(a), Some(b)) = (a, b) else {
            return false;
        };

        match self.graph.find_edge(a, b) {
            Some(edge) => self.graph.remove_edge(edge).is_some(),
            None => false,
        }
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, path: impl AsRef<Utf8Path>) -> bool {
        match self.index.remove(path.as_ref()) {
            Some(index) => self.graph.remove_node(index).is_some(),
            None => false,
        }
    }

    /// Replace the outgoing edges of `path` with exactly `dependencies`.
    pub fn replace_dependencies<P>(
        &mut self,
        path: impl AsRef<Utf8Path>,
        dependencies: impl IntoIterator<Item = P>,
    ) where
        P: AsRef<Utf8Path>,
    {
        let path = path.as_ref();
        let index = self.upsert_node(path);

        let stale: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.id())
            .collect();

        for edge in stale {
            self.graph.remove_edge(edge);
        }

        for dependency in dependencies {
            self.add_edge(path, dependency);
        }
    }

    fn paths(&self, index: NodeIndex, direction: Direction) -> BTreeSet<Utf8PathBuf> {
        self.graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn get_node(&self, path: impl AsRef<Utf8Path>) -> Option<GraphNode> {
        let &index = self.index.get(path.as_ref())?;

        Some(GraphNode {
            path: self.graph[index].clone(),
            dependencies: self.paths(index, Direction::Outgoing),
            dependents: self.paths(index, Direction::Incoming),
        })
    }

    /// Direct dependents of `path`.
    pub fn reverse_dependents_of(&self, path: impl AsRef<Utf8Path>) -> BTreeSet<Utf8PathBuf> {
        match self.index.get(path.as_ref()) {
            Some(&index) => self.paths(index, Direction::Incoming),
            None => BTreeSet::new(),
        }
    }

    /// Every file that depends on `path` directly or transitively, `path`
    /// itself excluded. Terminates on cyclic graphs.
    pub fn trace_reverse_dependents(&self, path: impl AsRef<Utf8Path>) -> BTreeSet<Utf8PathBuf> {
        let Some(&start) = self.index.get(path.as_ref()) else {
            return BTreeSet::new();
        };

        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut found = BTreeSet::new();

        while let Some(index) = bfs.next(reversed) {
            if index != start {
                found.insert(self.graph[index].clone());
            }
        }

        found
    }

    /// All node paths, sorted.
    pub fn nodes(&self) -> Vec<Utf8PathBuf> {
        let mut nodes: Vec<_> = self.index.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Nodes whose files no longer exist on disk, sorted.
    pub fn expired(&self) -> Vec<Utf8PathBuf> {
        let mut expired: Vec<_> = self
            .index
            .keys()
            .collect::<Vec<_>>()
            .into_par_iter()
            .filter(|path| !path.exists())
            .cloned()
            .collect();
        expired.sort();
        expired
    }

    /// Map of every node to its direct dependents.
    pub fn reverse_index(&self) -> BTreeMap<Utf8PathBuf, BTreeSet<Utf8PathBuf>> {
        self.index
            .iter()
            .map(|(path, &index)| (path.clone(), self.paths(index, Direction::Incoming)))
            .collect()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .index
            .iter()
            .map(|(path, &index)| {
                let node = SnapshotNode {
                    dependencies: self.paths(index, Direction::Outgoing),
                    dependents: self.paths(index, Direction::Incoming),
                };
                (path.clone(), node)
            })
            .collect();

        GraphSnapshot { nodes }
    }

    /// Rebuild a graph from its snapshot. Edges to files which are not nodes
    /// of the snapshot are dropped.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut graph = Self::new();

        for path in snapshot.nodes.keys() {
            graph.upsert_node(path);
        }

        for (path, node) in &snapshot.nodes {
            for dependency in &node.dependencies {
                if graph.contains(dependency) {
                    graph.add_edge(path, dependency);
                }
            }
        }

        graph
    }
}
