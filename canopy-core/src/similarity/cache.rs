use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::types::{ContentStatus, Node, NodeId};
use crate::url::{self, ParsedUrl};

use super::metrics::tokenize;

/// Everything the scorer reads from a node, precomputed once.
#[derive(Debug, Clone)]
pub struct NodeFeatures {
    pub id: NodeId,
    pub normalized_url: String,
    /// `None` for URLs the normalizer rejects.
    pub parsed: Option<ParsedUrl>,
    /// Lowercased title characters; `None` when the node has no usable title.
    pub title_chars: Option<Vec<char>>,
    pub title_tokens: BTreeSet<String>,
    pub depth: u32,
    pub child_count: u64,
    pub parent_id: Option<NodeId>,
    pub content_status: Option<ContentStatus>,
    pub has_content: Option<bool>,
    pub sku_count: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl NodeFeatures {
    pub fn of(node: &Node) -> Self {
        let title = node
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        Self {
            id: node.id,
            normalized_url: node.normalized_url.clone(),
            parsed: url::parse(&node.url).ok(),
            title_chars: title.map(|t| t.to_lowercase().chars().collect()),
            title_tokens: title.map(tokenize).unwrap_or_default(),
            depth: node.depth,
            child_count: node.children.len() as u64,
            parent_id: node.parent_id,
            content_status: node.metadata.content_status,
            has_content: node.metadata.has_content,
            sku_count: node.metadata.sku_count,
            last_modified: node.metadata.last_modified,
        }
    }
}

/// Precomputed features for one scoring run.
///
/// Built fresh per call from the node set and shared by reference; nothing in
/// it changes while scoring, so rayon workers read it concurrently.
#[derive(Debug, Default)]
pub struct SimilarityCache {
    features: Vec<NodeFeatures>,
    index: HashMap<NodeId, usize>,
}

impl SimilarityCache {
    pub fn build<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let mut cache = Self::default();
        for node in nodes {
            if cache.index.contains_key(&node.id) {
                continue;
            }
            cache.index.insert(node.id, cache.features.len());
            cache.features.push(NodeFeatures::of(node));
        }
        cache
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeFeatures> {
        self.index.get(&id).map(|&i| &self.features[i])
    }

    /// Features in insertion order.
    pub fn features(&self) -> &[NodeFeatures] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
