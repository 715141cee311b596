// Hierarchy builder: normalize, dedup, infer parents from path prefixes,
// then hand the linked nodes to the arena for depth and position assignment.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::types::{Node, NodeId, NodeMetadata, RawNode};
use crate::url::{self, ParsedUrl};

use super::tree::Hierarchy;
use super::{BuildOptions, BuildStats, BuildWarning, HierarchyResult};

/// Turns flat catalog records into a [`Hierarchy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchyBuilder;

struct Candidate {
    node: Node,
    parsed: Option<ParsedUrl>,
}

impl HierarchyBuilder {
    /// Build a tree from `raw_nodes`.
    ///
    /// Never fails: unparseable URLs, duplicates and structural problems are
    /// reported in [`HierarchyResult::warnings`].
    pub fn build(raw_nodes: &[RawNode], options: &BuildOptions) -> HierarchyResult {
        let start = Instant::now();
        let mut warnings = Vec::new();
        let mut stats = BuildStats {
            input_records: raw_nodes.len(),
            ..BuildStats::default()
        };

        // ── Normalize and dedup ────────────────────────────────────
        let mut candidates: Vec<Candidate> = Vec::with_capacity(raw_nodes.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(raw_nodes.len());

        for raw in raw_nodes {
            let (mut node, parsed) = match url::parse(&raw.url) {
                Ok(parsed) => (Node::from_parsed(&raw.url, &parsed), Some(parsed)),
                Err(e) => {
                    stats.invalid_urls += 1;
                    warnings.push(BuildWarning::InvalidUrl {
                        url: raw.url.clone(),
                        reason: e.to_string(),
                    });
                    (Node::unparsed(&raw.url), None)
                }
            };

            if !seen.insert(node.normalized_url.clone()) {
                stats.duplicates_skipped += 1;
                warnings.push(BuildWarning::DuplicateUrl {
                    url: raw.url.clone(),
                    normalized: node.normalized_url,
                });
                continue;
            }

            node.title = raw.title.clone().filter(|t| !t.trim().is_empty());
            node.metadata = merge_metadata(raw);
            candidates.push(Candidate { node, parsed });
        }

        // ── Parent inference, shortest paths first ─────────────────
        candidates.sort_by(|a, b| {
            segment_count(a)
                .cmp(&segment_count(b))
                .then_with(|| a.node.normalized_url.cmp(&b.node.normalized_url))
        });

        let by_url: HashMap<&str, NodeId> = candidates
            .iter()
            .map(|c| (c.node.normalized_url.as_str(), c.node.id))
            .collect();
        let fallback_root = options
            .root_url
            .as_deref()
            .and_then(|r| domain_root(r))
            .and_then(|r| by_url.get(r.as_str()).copied());

        let parents: Vec<Option<NodeId>> = candidates
            .iter()
            .map(|c| infer_parent(c, &by_url, fallback_root))
            .collect();

        let nodes = candidates
            .into_iter()
            .zip(parents)
            .map(|(c, parent)| Node {
                parent_id: parent,
                ..c.node
            });

        // ── Arena, depth, positions ────────────────────────────────
        let mut hierarchy = Hierarchy::from_nodes(nodes);
        hierarchy.assign_positions();
        warnings.extend(hierarchy.assign_depths());

        if options.validate {
            warnings.extend(hierarchy.detect_cycles());
            warnings.extend(hierarchy.detect_orphans());
            warnings.extend(hierarchy.detect_excess_depth(options.max_depth_warning));
        }
        dedup_in_order(&mut warnings);

        let root_ids = hierarchy.roots();
        let max_depth = hierarchy.max_depth();
        stats.nodes_created = hierarchy.len();
        stats.roots = root_ids.len();
        stats.max_depth = max_depth;

        info!(
            records = stats.input_records,
            nodes = stats.nodes_created,
            roots = stats.roots,
            max_depth,
            duplicates = stats.duplicates_skipped,
            invalid = stats.invalid_urls,
            warnings = warnings.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Hierarchy built"
        );
        for warning in &warnings {
            debug!(%warning, "Hierarchy warning");
        }

        HierarchyResult {
            hierarchy,
            root_ids,
            max_depth,
            stats,
            warnings,
        }
    }
}

/// Normalized form of `raw` when it names a domain root. Anything deeper
/// could be a descendant of the nodes it would adopt.
fn domain_root(raw: &str) -> Option<String> {
    match url::parse(raw) {
        Ok(parsed) if parsed.is_root() => Some(parsed.normalized()),
        Ok(parsed) => {
            warn!(
                root_url = raw,
                path = %parsed.normalized(),
                "Ignoring fallback root below the domain root"
            );
            None
        }
        Err(e) => {
            warn!(root_url = raw, error = %e, "Ignoring unparseable fallback root");
            None
        }
    }
}

fn segment_count(c: &Candidate) -> usize {
    c.parsed.as_ref().map_or(0, |p| p.segments.len())
}

/// Longest existing path prefix, else the designated fallback root.
/// Domain roots and unparseable records stay roots.
fn infer_parent(
    c: &Candidate,
    by_url: &HashMap<&str, NodeId>,
    fallback_root: Option<NodeId>,
) -> Option<NodeId> {
    let parsed = c.parsed.as_ref()?;
    if parsed.is_root() {
        return None;
    }
    (0..parsed.segments.len())
        .rev()
        .find_map(|depth| by_url.get(parsed.prefix(depth).as_str()).copied())
        .or(fallback_root)
        .filter(|&parent| parent != c.node.id)
}

/// Record-level sitemap fields fill the metadata slots the record left empty.
fn merge_metadata(raw: &RawNode) -> NodeMetadata {
    let mut meta = raw.metadata.clone().unwrap_or_default();
    if meta.last_modified.is_none() {
        meta.last_modified = raw.lastmod;
    }
    if meta.changefreq.is_none() {
        meta.changefreq.clone_from(&raw.changefreq);
    }
    if meta.priority.is_none() {
        meta.priority = raw.priority;
    }
    meta
}

fn dedup_in_order(warnings: &mut Vec<BuildWarning>) {
    let mut seen = HashSet::new();
    warnings.retain(|w| seen.insert(w.clone()));
}
