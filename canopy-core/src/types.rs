use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(NodeId);

impl NodeId {
    /// Derive the id of a node from its normalized URL.
    ///
    /// The same normalized URL always yields the same id, across runs and processes.
    pub fn from_normalized_url(normalized: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, normalized.as_bytes()))
    }
}

// ── Input records ──────────────────────────────────────────────────

/// One catalog entry as supplied by an external reader (sitemap, export, crawl).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub lastmod: Option<DateTime<Utc>>,
    #[serde(default)]
    pub changefreq: Option<String>,
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub metadata: Option<NodeMetadata>,
}

impl RawNode {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── Node types ─────────────────────────────────────────────────────

/// Editorial state of the content behind a catalog page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    Published,
    Archived,
    Missing,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
            Self::Missing => "missing",
        }
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known per-node attributes, with an open map for anything unclassified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Number of products listed under this category.
    #[serde(default)]
    pub sku_count: Option<u64>,
    /// Whether the page carries editorial content beyond a listing.
    #[serde(default)]
    pub has_content: Option<bool>,
    #[serde(default)]
    pub content_status: Option<ContentStatus>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub changefreq: Option<String>,
    #[serde(default)]
    pub priority: Option<f64>,
    /// Unclassified keys passed through from the source.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NodeMetadata {
    /// Look up an unclassified attribute.
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}

/// A catalog entry placed in the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// URL as supplied in the input.
    pub url: String,
    /// Canonical form used as the dedup key.
    pub normalized_url: String,
    /// Normalized path (`/shoes/running`, `/` for a domain root), empty for unparseable inputs.
    pub path: String,
    pub title: Option<String>,
    /// Last path segment, empty for a domain root.
    pub slug: String,
    /// Path segments from the root down to this node.
    pub breadcrumb: Vec<String>,
    pub depth: u32,
    pub parent_id: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Index among siblings after sorting by normalized URL.
    pub position: u32,
    pub metadata: NodeMetadata,
}

impl Node {
    /// A standalone node for `url`, with no parent, children or metadata.
    ///
    /// Unparseable input falls back to [`url::fallback_key`](crate::url::fallback_key)
    /// with an empty path.
    pub fn new(url: &str) -> Self {
        match crate::url::parse(url) {
            Ok(parsed) => Self::from_parsed(url, &parsed),
            Err(_) => Self::unparsed(url),
        }
    }

    pub(crate) fn from_parsed(url: &str, parsed: &crate::url::ParsedUrl) -> Self {
        let normalized_url = parsed.normalized();
        Self {
            id: NodeId::from_normalized_url(&normalized_url),
            url: url.to_string(),
            path: parsed.path(),
            slug: parsed.slug().to_string(),
            breadcrumb: parsed.segments.clone(),
            normalized_url,
            title: None,
            depth: 0,
            parent_id: None,
            children: Vec::new(),
            position: 0,
            metadata: NodeMetadata::default(),
        }
    }

    pub(crate) fn unparsed(url: &str) -> Self {
        let normalized_url = crate::url::fallback_key(url);
        Self {
            id: NodeId::from_normalized_url(&normalized_url),
            url: url.to_string(),
            normalized_url,
            path: String::new(),
            title: None,
            slug: String::new(),
            breadcrumb: Vec::new(),
            depth: 0,
            parent_id: None,
            children: Vec::new(),
            position: 0,
            metadata: NodeMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// A domain root: `https://host/` or a bare `/`.
    pub fn is_domain_root(&self) -> bool {
        self.breadcrumb.is_empty() && self.normalized_url.ends_with('/')
    }

    pub fn title_str(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }
}

// ── Relationships ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// Parent → child, straight from the tree.
    ParentChild,
    /// Two nodes under the same immediate parent.
    Sibling,
    /// One node's URL mentions the other's slug.
    CrossLink,
    /// A node with neither parent nor children.
    Orphan,
    /// Same normalized URL or same title.
    Duplicate,
}

impl RelationshipKind {
    pub const ALL: [Self; 5] = [
        Self::ParentChild,
        Self::Sibling,
        Self::CrossLink,
        Self::Orphan,
        Self::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParentChild => "parent_child",
            Self::Sibling => "sibling",
            Self::CrossLink => "cross_link",
            Self::Orphan => "orphan",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed edge between two nodes, produced by one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub source_id: NodeId,
    pub target_id: NodeId,
    /// Strength in `[0, 1]`.
    pub strength: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Relationship {
    pub fn new(
        kind: RelationshipKind,
        source_id: NodeId,
        target_id: NodeId,
        strength: f64,
    ) -> Self {
        Self {
            kind,
            source_id,
            target_id,
            strength: strength.clamp(0.0, 1.0),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Whether this edge touches `id` on either end.
    pub fn involves(&self, id: NodeId) -> bool {
        self.source_id == id || self.target_id == id
    }

    /// The endpoint opposite `id`, or `id` itself for self-edges such as orphans.
    pub fn other(&self, id: NodeId) -> NodeId {
        if self.source_id == id {
            self.target_id
        } else {
            self.source_id
        }
    }
}

// ── Similarity ─────────────────────────────────────────────────────

/// Pairwise similarity across the four scoring dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub node1_id: NodeId,
    pub node2_id: NodeId,
    pub url: f64,
    pub title: f64,
    pub structural: f64,
    pub content: f64,
    /// Weighted combination of the four dimensions.
    pub overall: f64,
    /// How much the dimensions agree and how many carry signal.
    pub confidence: f64,
}

impl SimilarityResult {
    pub fn dimensions(&self) -> [f64; 4] {
        [self.url, self.title, self.structural, self.content]
    }
}
