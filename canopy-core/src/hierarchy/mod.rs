//! Flat URL list → category tree.
//!
//! [`builder::HierarchyBuilder`] turns raw catalog records into a [`tree::Hierarchy`]
//! arena. Problems with individual records surface as [`BuildWarning`]s and never
//! abort the batch.

pub mod builder;
pub mod tree;

use serde::{Deserialize, Serialize};

use crate::config::HierarchySection;
use crate::types::{Node, NodeId};

pub use builder::HierarchyBuilder;
pub use tree::Hierarchy;

/// Hierarchies deeper than this are reported.
pub const DEFAULT_MAX_DEPTH_WARNING: u32 = 10;

/// Non-fatal problem found while building or validating a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildWarning {
    /// A record normalized to a URL that was already taken; the record was skipped.
    DuplicateUrl { url: String, normalized: String },
    /// A record's URL could not be parsed; the node was kept with fallback values.
    InvalidUrl { url: String, reason: String },
    /// Parent links form a loop. `cycle` lists the member URLs, sorted.
    CircularReference { cycle: Vec<String> },
    /// A node's parent id points at a node that does not exist.
    OrphanedNode { url: String, missing_parent: NodeId },
    /// The tree is deeper than the configured limit.
    DeepHierarchy { url: String, depth: u32, limit: u32 },
}

impl std::fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateUrl { url, normalized } => {
                write!(f, "duplicate URL skipped: {url} (normalizes to {normalized})")
            }
            Self::InvalidUrl { url, reason } => write!(f, "invalid URL {url:?}: {reason}"),
            Self::CircularReference { cycle } => {
                write!(f, "circular reference between {}", cycle.join(" -> "))
            }
            Self::OrphanedNode {
                url,
                missing_parent,
            } => write!(f, "orphaned node {url}: parent {missing_parent} does not exist"),
            Self::DeepHierarchy { url, depth, limit } => {
                write!(f, "hierarchy depth {depth} exceeds {limit} at {url}")
            }
        }
    }
}

/// Knobs for one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Run the validation pass (cycles, orphans, depth) after construction.
    pub validate: bool,
    /// Node that parentless nodes fall back to, when present in the input.
    pub root_url: Option<String>,
    pub max_depth_warning: u32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            validate: true,
            root_url: None,
            max_depth_warning: DEFAULT_MAX_DEPTH_WARNING,
        }
    }
}

impl From<&HierarchySection> for BuildOptions {
    fn from(section: &HierarchySection) -> Self {
        Self {
            validate: section.validate,
            root_url: section.root_url.clone(),
            max_depth_warning: section.max_depth_warning,
        }
    }
}

/// Counters describing one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub input_records: usize,
    pub nodes_created: usize,
    pub duplicates_skipped: usize,
    pub invalid_urls: usize,
    pub roots: usize,
    pub max_depth: u32,
}

/// Output of [`HierarchyBuilder::build`].
#[derive(Debug, Clone)]
pub struct HierarchyResult {
    pub hierarchy: Hierarchy,
    pub root_ids: Vec<NodeId>,
    pub max_depth: u32,
    pub stats: BuildStats,
    pub warnings: Vec<BuildWarning>,
}

impl HierarchyResult {
    pub fn nodes(&self) -> &[Node] {
        self.hierarchy.nodes()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Count the warnings matching a predicate,
    /// e.g. `|w| matches!(w, BuildWarning::DuplicateUrl { .. })`.
    pub fn count_warnings(&self, pred: impl Fn(&BuildWarning) -> bool) -> usize {
        self.warnings.iter().filter(|w| pred(w)).count()
    }
}
