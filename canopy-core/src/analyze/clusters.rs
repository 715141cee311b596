// Sibling clusters: connected components of the strong-sibling graph.

use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::Bfs;

use crate::types::{NodeId, RelationshipKind};

use super::Analysis;

pub const DEFAULT_CLUSTER_MIN_SIZE: usize = 3;
pub const DEFAULT_CLUSTER_EDGE_THRESHOLD: f64 = 0.5;

/// A petgraph `UnGraph` of sibling edges, with `NodeId` ↔ `NodeIndex` mapping.
#[derive(Debug, Default)]
pub struct InMemorySiblingGraph {
    pub graph: UnGraph<NodeId, f64>,
    pub node_to_index: HashMap<NodeId, NodeIndex>,
}

impl InMemorySiblingGraph {
    /// Sibling edges strictly stronger than `min_strength`.
    pub fn from_analysis(analysis: &Analysis, min_strength: f64) -> Self {
        let mut g = Self::default();
        for rel in analysis.of_kind(RelationshipKind::Sibling) {
            if rel.strength <= min_strength {
                continue;
            }
            let a = g.index_of(rel.source_id);
            let b = g.index_of(rel.target_id);
            g.graph.add_edge(a, b, rel.strength);
        }
        g
    }

    fn index_of(&mut self, id: NodeId) -> NodeIndex {
        *self
            .node_to_index
            .entry(id)
            .or_insert_with(|| self.graph.add_node(id))
    }

    /// Connected components, each sorted, in order of first appearance.
    pub fn components(&self) -> Vec<Vec<NodeId>> {
        let mut visited = vec![false; self.graph.node_count()];
        let mut out = Vec::new();
        for start in self.graph.node_indices() {
            if visited[start.index()] {
                continue;
            }
            let mut component = Vec::new();
            let mut bfs = Bfs::new(&self.graph, start);
            while let Some(ix) = bfs.next(&self.graph) {
                visited[ix.index()] = true;
                component.push(self.graph[ix]);
            }
            component.sort();
            out.push(component);
        }
        out
    }
}

/// Sibling clusters of at least `min_size` nodes, using the default edge threshold.
pub fn find_clusters(analysis: &Analysis, min_size: usize) -> Vec<Vec<NodeId>> {
    find_clusters_with(analysis, min_size, DEFAULT_CLUSTER_EDGE_THRESHOLD)
}

pub fn find_clusters_with(
    analysis: &Analysis,
    min_size: usize,
    min_strength: f64,
) -> Vec<Vec<NodeId>> {
    InMemorySiblingGraph::from_analysis(analysis, min_strength)
        .components()
        .into_iter()
        .filter(|c| c.len() >= min_size)
        .collect()
}
