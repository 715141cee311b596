//! Pairwise multi-factor similarity between catalog nodes.
//!
//! Four dimensions (URL, title, structural position, content metadata) are
//! scored in `[0, 1]` and combined with [`SimilarityWeights`]. Every scoring
//! function is symmetric in its arguments.
//!
//! All-pairs operations build a [`SimilarityCache`] once per call and fan out
//! over rayon.

// Scores are ratios of small counts.
#![allow(clippy::cast_precision_loss)]

pub mod cache;
pub mod metrics;

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SimilaritySection;
use crate::types::{Node, NodeId, SimilarityResult};

pub use cache::{NodeFeatures, SimilarityCache};

pub const DEFAULT_MIN_SIMILARITY: f64 = 0.3;
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.85;
pub const DEFAULT_CLUSTER_THRESHOLD: f64 = 0.5;

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Relative weight of each dimension in the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub url: f64,
    pub title: f64,
    pub structural: f64,
    pub content: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            url: 0.25,
            title: 0.25,
            structural: 0.2,
            content: 0.3,
        }
    }
}

impl SimilarityWeights {
    fn total(&self) -> f64 {
        self.url + self.title + self.structural + self.content
    }
}

/// Scores node pairs. Stateless apart from its weights and threshold.
#[derive(Debug, Clone)]
pub struct SimilarityCalculator {
    weights: SimilarityWeights,
    min_similarity: f64,
}

impl Default for SimilarityCalculator {
    fn default() -> Self {
        Self::new(SimilarityWeights::default())
    }
}

impl From<&SimilaritySection> for SimilarityCalculator {
    fn from(section: &SimilaritySection) -> Self {
        Self::new(section.weights).with_min_similarity(section.min_similarity)
    }
}

impl SimilarityCalculator {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self {
            weights,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }

    /// Lowest overall score [`find_similar`](Self::find_similar) returns.
    #[must_use]
    pub fn with_min_similarity(mut self, min_similarity: f64) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn weights(&self) -> &SimilarityWeights {
        &self.weights
    }

    /// Score one pair of nodes.
    pub fn similarity(&self, a: &Node, b: &Node) -> SimilarityResult {
        self.score(&NodeFeatures::of(a), &NodeFeatures::of(b))
    }

    /// Score one pair of precomputed feature sets.
    pub fn score(&self, a: &NodeFeatures, b: &NodeFeatures) -> SimilarityResult {
        let url = url_similarity(a, b);
        let title = title_similarity(a, b);
        let structural = structural_similarity(a, b);
        let content = content_similarity(a, b);

        let w = &self.weights;
        let total = w.total();
        let overall = if total > 0.0 {
            ((w.url * url + w.title * title + w.structural * structural + w.content * content)
                / total)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        SimilarityResult {
            node1_id: a.id,
            node2_id: b.id,
            url,
            title,
            structural,
            content,
            overall,
            confidence: confidence(&[url, title, structural, content]),
        }
    }

    /// Best matches for `target` among `candidates`, at or above the minimum
    /// similarity, best first. The target itself is never returned.
    pub fn find_similar(
        &self,
        target: &Node,
        candidates: &[Node],
        limit: usize,
    ) -> Vec<SimilarityResult> {
        let target_features = NodeFeatures::of(target);
        let cache = SimilarityCache::build(candidates.iter().filter(|c| c.id != target.id));

        let mut results: Vec<SimilarityResult> = cache
            .features()
            .par_iter()
            .map(|candidate| self.score(&target_features, candidate))
            .filter(|r| r.overall >= self.min_similarity)
            .collect();
        sort_results(&mut results);
        results.truncate(limit);
        results
    }

    /// All unordered pairs scoring at or above `threshold`, best first.
    pub fn find_duplicates(&self, nodes: &[Node], threshold: f64) -> Vec<SimilarityResult> {
        let start = Instant::now();
        let cache = SimilarityCache::build(nodes);
        let features = cache.features();

        let mut pairs: Vec<SimilarityResult> = (0..features.len())
            .into_par_iter()
            .flat_map_iter(|i| {
                features[i + 1..]
                    .iter()
                    .map(move |other| (i, other))
            })
            .map(|(i, other)| self.score(&features[i], other))
            .filter(|r| r.overall >= threshold)
            .collect();
        sort_results(&mut pairs);

        debug!(
            nodes = features.len(),
            pairs = pairs.len(),
            threshold,
            elapsed_ms = start.elapsed().as_millis(),
            "Duplicate scan finished"
        );
        pairs
    }

    /// Greedy clustering: each still-unassigned node seeds a cluster and pulls
    /// in every unassigned node scoring at or above `threshold` against it.
    ///
    /// Every input node ends up in exactly one cluster; nodes with no close
    /// match form singleton clusters.
    pub fn cluster_by_similarity(&self, nodes: &[Node], threshold: f64) -> Vec<Vec<NodeId>> {
        let cache = SimilarityCache::build(nodes);
        let features = cache.features();
        let mut assigned = vec![false; features.len()];
        let mut clusters = Vec::new();

        for seed in 0..features.len() {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;

            let joined: Vec<usize> = (seed + 1..features.len())
                .into_par_iter()
                .filter(|&j| !assigned[j])
                .filter(|&j| self.score(&features[seed], &features[j]).overall >= threshold)
                .collect();

            let mut cluster = vec![features[seed].id];
            for j in joined {
                assigned[j] = true;
                cluster.push(features[j].id);
            }
            clusters.push(cluster);
        }
        clusters
    }
}

fn sort_results(results: &mut [SimilarityResult]) {
    results.sort_by(|a, b| {
        b.overall
            .total_cmp(&a.overall)
            .then_with(|| a.node1_id.cmp(&b.node1_id))
            .then_with(|| a.node2_id.cmp(&b.node2_id))
    });
}

// ── Dimensions ─────────────────────────────────────────────────────

fn url_similarity(a: &NodeFeatures, b: &NodeFeatures) -> f64 {
    let (Some(pa), Some(pb)) = (&a.parsed, &b.parsed) else {
        return if a.normalized_url == b.normalized_url {
            1.0
        } else {
            0.0
        };
    };

    let domain = if pa.domain == pb.domain { 1.0 } else { 0.0 };

    let segs_a: BTreeSet<&String> = pa.segments.iter().collect();
    let segs_b: BTreeSet<&String> = pb.segments.iter().collect();
    let path = 0.6 * metrics::common_prefix_ratio(&pa.segments, &pb.segments)
        + 0.4 * metrics::jaccard(&segs_a, &segs_b);

    let query = metrics::query_similarity(&pa.query, &pb.query);

    0.3 * domain + 0.5 * path + 0.2 * query
}

fn title_similarity(a: &NodeFeatures, b: &NodeFeatures) -> f64 {
    let (ca, cb) = match (&a.title_chars, &b.title_chars) {
        (Some(ca), Some(cb)) => (ca, cb),
        (None, None) => return 1.0,
        _ => return 0.0,
    };
    let edit = metrics::edit_similarity(ca, cb);
    let tokens = if a.title_tokens.is_empty() && b.title_tokens.is_empty() {
        edit
    } else {
        metrics::jaccard(&a.title_tokens, &b.title_tokens)
    };
    0.5 * tokens + 0.5 * edit
}

fn structural_similarity(a: &NodeFeatures, b: &NodeFeatures) -> f64 {
    let depth_gap = f64::from(a.depth.abs_diff(b.depth));
    let same_parent = if a.parent_id == b.parent_id { 1.0 } else { 0.0 };
    0.4 / (1.0 + depth_gap)
        + 0.3 * metrics::count_closeness(a.child_count, b.child_count)
        + 0.3 * same_parent
}

/// Weighted agreement over the metadata components. A component absent on
/// both sides agrees; present on one side only, it does not.
fn content_similarity(a: &NodeFeatures, b: &NodeFeatures) -> f64 {
    let status = if a.content_status == b.content_status { 1.0 } else { 0.0 };
    let presence = if a.has_content == b.has_content { 1.0 } else { 0.0 };
    let skus = match (a.sku_count, b.sku_count) {
        (Some(x), Some(y)) => metrics::count_closeness(x, y),
        (None, None) => 1.0,
        _ => 0.0,
    };
    let recency = match (a.last_modified, b.last_modified) {
        (Some(x), Some(y)) => {
            let gap = (x - y).num_seconds().unsigned_abs() as f64;
            1.0 - gap.min(SECONDS_PER_YEAR) / SECONDS_PER_YEAR
        }
        (None, None) => 1.0,
        _ => 0.0,
    };
    0.3 * status + 0.2 * presence + 0.25 * skus + 0.25 * recency
}

/// 0.6 × agreement between dimensions + 0.4 × share of dimensions with signal.
fn confidence(scores: &[f64; 4]) -> f64 {
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let consistency = (1.0 - 2.0 * variance.sqrt()).clamp(0.0, 1.0);
    let coverage = scores.iter().filter(|s| **s > 0.0).count() as f64 / n;
    (0.6 * consistency + 0.4 * coverage).clamp(0.0, 1.0)
}

/// Ids appearing in more than one cluster; empty for any valid clustering.
pub fn overlapping_members(clusters: &[Vec<NodeId>]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut repeated: Vec<NodeId> = clusters
        .iter()
        .flatten()
        .filter(|id| !seen.insert(**id))
        .copied()
        .collect();
    repeated.sort();
    repeated.dedup();
    repeated
}
