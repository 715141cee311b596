//! Relationship detection, clustering and health metrics over a built hierarchy.

pub mod clusters;
pub mod health;
pub mod relationships;

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{NodeId, Relationship, RelationshipKind};

pub use clusters::{InMemorySiblingGraph, find_clusters};
pub use health::{HealthReport, analyze_health};
pub use relationships::HierarchyAnalyzer;

/// Output of one [`HierarchyAnalyzer::analyze`] run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Analysis {
    pub relationships: Vec<Relationship>,
    #[serde(skip)]
    pub index: RelationshipIndex,
}

impl Analysis {
    pub fn new(relationships: Vec<Relationship>) -> Self {
        let index = RelationshipIndex::build(&relationships);
        Self {
            relationships,
            index,
        }
    }

    pub fn count(&self, kind: RelationshipKind) -> usize {
        self.relationships.iter().filter(|r| r.kind == kind).count()
    }

    pub fn of_kind(&self, kind: RelationshipKind) -> impl Iterator<Item = &Relationship> {
        self.relationships.iter().filter(move |r| r.kind == kind)
    }

    /// Relationships touching `id`, optionally restricted to one kind.
    pub fn related(&self, id: NodeId, kind: Option<RelationshipKind>) -> Vec<&Relationship> {
        self.index.related(&self.relationships, id, kind)
    }

    pub fn strength(&self, a: NodeId, b: NodeId) -> Option<f64> {
        self.index.strength(a, b)
    }
}

/// Lookup tables over a relationship list.
#[derive(Debug, Clone, Default)]
pub struct RelationshipIndex {
    by_node: HashMap<NodeId, Vec<usize>>,
    strongest: HashMap<(NodeId, NodeId), f64>,
}

fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl RelationshipIndex {
    pub fn build(relationships: &[Relationship]) -> Self {
        let mut index = Self::default();
        for (i, rel) in relationships.iter().enumerate() {
            index.by_node.entry(rel.source_id).or_default().push(i);
            if rel.target_id != rel.source_id {
                index.by_node.entry(rel.target_id).or_default().push(i);
            }
            let entry = index
                .strongest
                .entry(pair_key(rel.source_id, rel.target_id))
                .or_insert(rel.strength);
            *entry = entry.max(rel.strength);
        }
        index
    }

    /// Entries of `relationships` (the list this index was built from) touching `id`.
    pub fn related<'a>(
        &self,
        relationships: &'a [Relationship],
        id: NodeId,
        kind: Option<RelationshipKind>,
    ) -> Vec<&'a Relationship> {
        self.by_node
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|&i| relationships.get(i))
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .collect()
    }

    /// Strongest relationship of any kind between `a` and `b`, in either direction.
    pub fn strength(&self, a: NodeId, b: NodeId) -> Option<f64> {
        self.strongest.get(&pair_key(a, b)).copied()
    }

    pub fn are_related(&self, a: NodeId, b: NodeId) -> bool {
        self.strongest.contains_key(&pair_key(a, b))
    }
}
