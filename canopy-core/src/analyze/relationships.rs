// Relationship classification: parent/child, sibling, duplicate, cross-link, orphan.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use rayon::prelude::*;
use tracing::info;

use crate::config::{AnalysisSection, CanopyConfig};
use crate::hierarchy::Hierarchy;
use crate::similarity::{SimilarityCache, SimilarityCalculator};
use crate::types::{Node, NodeId, Relationship, RelationshipKind};
use crate::url;

use super::{Analysis, RelationshipIndex, clusters, pair_key};

/// Classifies every node of a hierarchy against the full node set.
#[derive(Debug, Clone, Default)]
pub struct HierarchyAnalyzer {
    calculator: SimilarityCalculator,
    settings: AnalysisSection,
    designated_root: Option<String>,
}

impl From<&CanopyConfig> for HierarchyAnalyzer {
    fn from(config: &CanopyConfig) -> Self {
        let analyzer = Self::new(
            SimilarityCalculator::from(&config.similarity),
            config.analysis.clone(),
        );
        match &config.hierarchy.root_url {
            Some(root) => analyzer.with_designated_root(root),
            None => analyzer,
        }
    }
}

impl HierarchyAnalyzer {
    pub fn new(calculator: SimilarityCalculator, settings: AnalysisSection) -> Self {
        Self {
            calculator,
            settings,
            designated_root: None,
        }
    }

    /// Exclude this node from orphan detection even when it has no children.
    #[must_use]
    pub fn with_designated_root(mut self, root_url: &str) -> Self {
        self.designated_root = url::normalize(root_url).ok();
        self
    }

    pub fn settings(&self) -> &AnalysisSection {
        &self.settings
    }

    pub fn analyze(&self, hierarchy: &Hierarchy) -> Analysis {
        let start = Instant::now();
        let cache = SimilarityCache::build(hierarchy.iter());

        let mut relationships = parent_child(hierarchy);
        relationships.extend(self.siblings(hierarchy, &cache));
        relationships.extend(self.duplicates(hierarchy));

        let related: HashSet<(NodeId, NodeId)> = relationships
            .iter()
            .map(|r| pair_key(r.source_id, r.target_id))
            .collect();
        relationships.extend(self.cross_links(hierarchy, related));
        relationships.extend(self.orphans(hierarchy));

        let analysis = Analysis::new(relationships);
        info!(
            nodes = hierarchy.len(),
            relationships = analysis.relationships.len(),
            parent_child = analysis.count(RelationshipKind::ParentChild),
            sibling = analysis.count(RelationshipKind::Sibling),
            cross_link = analysis.count(RelationshipKind::CrossLink),
            orphan = analysis.count(RelationshipKind::Orphan),
            duplicate = analysis.count(RelationshipKind::Duplicate),
            elapsed_ms = start.elapsed().as_millis(),
            "Relationship analysis complete"
        );
        analysis
    }

    /// Connected sibling groups of at least `cluster_min_size` nodes.
    pub fn find_clusters(&self, analysis: &Analysis) -> Vec<Vec<NodeId>> {
        clusters::find_clusters_with(
            analysis,
            self.settings.cluster_min_size,
            self.settings.cluster_edge_threshold,
        )
    }

    /// Rebuild only the lookup index, e.g. after filtering relationships.
    pub fn reindex(analysis: &mut Analysis) {
        analysis.index = RelationshipIndex::build(&analysis.relationships);
    }

    // ── Rules ──────────────────────────────────────────────────────

    fn siblings(&self, hierarchy: &Hierarchy, cache: &SimilarityCache) -> Vec<Relationship> {
        let floor = self.settings.sibling_floor;
        let floor_below = self.settings.sibling_floor_below;

        hierarchy
            .nodes()
            .par_iter()
            .filter(|parent| parent.children.len() > 1)
            .flat_map_iter(|parent| {
                let kids: Vec<NodeId> = parent
                    .children
                    .iter()
                    .copied()
                    .filter(|k| *k != parent.id)
                    .collect();
                let mut out = Vec::new();
                for (i, a) in kids.iter().enumerate() {
                    for b in &kids[i + 1..] {
                        let (Some(fa), Some(fb)) = (cache.get(*a), cache.get(*b)) else {
                            continue;
                        };
                        let raw = self.calculator.score(fa, fb).overall;
                        let strength = if raw < floor_below { floor } else { raw };
                        out.push(
                            Relationship::new(RelationshipKind::Sibling, *a, *b, strength)
                                .with_meta("similarity", raw)
                                .with_meta("parent_id", parent.id.to_string()),
                        );
                    }
                }
                out
            })
            .collect()
    }

    fn duplicates(&self, hierarchy: &Hierarchy) -> Vec<Relationship> {
        let mut by_url: BTreeMap<&str, Vec<NodeId>> = BTreeMap::new();
        let mut by_title: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for node in hierarchy.iter() {
            by_url.entry(&node.normalized_url).or_default().push(node.id);
            if let Some(title) = normalized_title(node) {
                by_title.entry(title).or_default().push(node.id);
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let groups = by_url
            .values()
            .map(|ids| (ids, "url"))
            .chain(by_title.values().map(|ids| (ids, "title")));
        for (ids, matched_on) in groups {
            for (i, a) in ids.iter().enumerate() {
                for b in &ids[i + 1..] {
                    if seen.insert(pair_key(*a, *b)) {
                        out.push(
                            Relationship::new(
                                RelationshipKind::Duplicate,
                                *a,
                                *b,
                                self.settings.duplicate_strength,
                            )
                            .with_meta("matched_on", matched_on),
                        );
                    }
                }
            }
        }
        out
    }

    /// A node whose path mentions another node's slug, where the two are not
    /// already related and neither is an ancestor of the other.
    fn cross_links(
        &self,
        hierarchy: &Hierarchy,
        mut related: HashSet<(NodeId, NodeId)>,
    ) -> Vec<Relationship> {
        let min_slug = self.settings.cross_link_min_slug;
        let targets: Vec<&Node> = hierarchy
            .iter()
            .filter(|n| n.slug.chars().count() >= min_slug)
            .collect();

        let mut candidates: Vec<(NodeId, NodeId, String)> = hierarchy
            .nodes()
            .par_iter()
            .filter(|source| !source.path.is_empty())
            .flat_map_iter(|source| {
                let ancestors: HashSet<NodeId> =
                    hierarchy.ancestors(source.id).into_iter().collect();
                targets
                    .iter()
                    .filter(move |target| {
                        target.id != source.id
                            && !ancestors.contains(&target.id)
                            && source.path.contains(target.slug.as_str())
                    })
                    .map(move |target| (source.id, target.id, target.slug.clone()))
                    .collect::<Vec<_>>()
            })
            .filter(|(source, target, _)| !hierarchy.is_ancestor(*source, *target))
            .collect();
        candidates.sort();

        let mut out = Vec::new();
        for (source, target, slug) in candidates {
            if related.insert(pair_key(source, target)) {
                out.push(
                    Relationship::new(
                        RelationshipKind::CrossLink,
                        source,
                        target,
                        self.settings.cross_link_strength,
                    )
                    .with_meta("slug", slug),
                );
            }
        }
        out
    }

    /// Nodes with neither parent nor children, designated roots excluded.
    fn orphans(&self, hierarchy: &Hierarchy) -> Vec<Relationship> {
        hierarchy
            .iter()
            .filter(|n| hierarchy.parent_of(n.id).is_none() && n.children.is_empty())
            .filter(|n| !n.is_domain_root())
            .filter(|n| self.designated_root.as_deref() != Some(n.normalized_url.as_str()))
            .map(|n| Relationship::new(RelationshipKind::Orphan, n.id, n.id, 1.0))
            .collect()
    }
}

fn parent_child(hierarchy: &Hierarchy) -> Vec<Relationship> {
    hierarchy
        .iter()
        .filter_map(|child| {
            let parent = hierarchy.parent_of(child.id)?;
            (parent.id != child.id).then(|| {
                Relationship::new(RelationshipKind::ParentChild, parent.id, child.id, 1.0)
            })
        })
        .collect()
}

fn normalized_title(node: &Node) -> Option<String> {
    let title = node.title.as_deref()?.trim();
    (!title.is_empty()).then(|| title.to_lowercase())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::hierarchy::{BuildOptions, HierarchyBuilder};
    use crate::similarity::SimilarityWeights;
    use crate::types::{ContentStatus, NodeMetadata, RawNode};

    fn build(records: Vec<RawNode>) -> Hierarchy {
        HierarchyBuilder::build(&records, &BuildOptions::default()).hierarchy
    }

    fn id(h: &Hierarchy, url: &str) -> NodeId {
        h.get_by_url(url).unwrap().id
    }

    #[test]
    fn parent_child_edges_have_full_strength() {
        let h = build(vec![
            RawNode::new("/"),
            RawNode::new("/shoes"),
            RawNode::new("/shoes/running"),
        ]);
        let analysis = HierarchyAnalyzer::default().analyze(&h);

        assert_eq!(analysis.count(RelationshipKind::ParentChild), 2);
        assert_eq!(analysis.strength(id(&h, "/"), id(&h, "/shoes")), Some(1.0));
        let rel = analysis
            .related(id(&h, "/shoes/running"), Some(RelationshipKind::ParentChild))
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(rel.source_id, id(&h, "/shoes"));
    }

    fn stocked() -> NodeMetadata {
        NodeMetadata {
            content_status: Some(ContentStatus::Published),
            has_content: Some(true),
            sku_count: Some(100),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            ..NodeMetadata::default()
        }
    }

    #[test]
    fn weak_siblings_are_floored_and_strong_ones_keep_their_score() {
        // Content-only scoring: /bare shares nothing with the stocked pages.
        let content_only = SimilarityCalculator::new(SimilarityWeights {
            url: 0.0,
            title: 0.0,
            structural: 0.0,
            content: 1.0,
        });
        let analyzer = HierarchyAnalyzer::new(content_only, AnalysisSection::default());
        let h = build(vec![
            RawNode::new("/"),
            RawNode::new("/shoes").with_metadata(stocked()),
            RawNode::new("/boots").with_metadata(stocked()),
            RawNode::new("/bare"),
        ]);
        let analysis = analyzer.analyze(&h);
        assert_eq!(analysis.count(RelationshipKind::Sibling), 3);

        let sibling = |a: &str, b: &str| {
            let (a, b) = (id(&h, a), id(&h, b));
            analysis
                .of_kind(RelationshipKind::Sibling)
                .find(|r| pair_key(r.source_id, r.target_id) == pair_key(a, b))
                .unwrap()
        };

        let weak = sibling("/shoes", "/bare");
        let raw = weak.metadata["similarity"].as_f64().unwrap();
        assert!(raw < 0.3, "raw {raw}");
        assert!((weak.strength - 0.5).abs() < f64::EPSILON);

        let strong = sibling("/shoes", "/boots");
        let raw = strong.metadata["similarity"].as_f64().unwrap();
        assert!(raw >= 0.3, "raw {raw}");
        assert!((strong.strength - raw).abs() < f64::EPSILON);
    }

    #[test]
    fn same_title_is_a_duplicate() {
        let h = build(vec![
            RawNode::new("/"),
            RawNode::new("/mens/running").with_title("Running Shoes"),
            RawNode::new("/sale/trainers").with_title("running shoes "),
        ]);
        let analysis = HierarchyAnalyzer::default().analyze(&h);
        let dups: Vec<_> = analysis.of_kind(RelationshipKind::Duplicate).collect();
        assert_eq!(dups.len(), 1);
        assert!((dups[0].strength - 0.9).abs() < f64::EPSILON);
        assert_eq!(dups[0].metadata["matched_on"], "title");
    }

    #[test]
    fn same_normalized_url_is_a_duplicate() {
        // Externally supplied nodes can share a URL under different ids.
        let a = Node::new("/shoes");
        let mut b = Node::new("/shoes");
        b.id = NodeId::from_normalized_url("legacy:shoes");
        let h = Hierarchy::from_nodes([a, b]);
        let analysis = HierarchyAnalyzer::default().analyze(&h);
        let dups: Vec<_> = analysis.of_kind(RelationshipKind::Duplicate).collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].metadata["matched_on"], "url");
    }

    #[test]
    fn cross_links_skip_ancestors_and_related_nodes() {
        let h = build(vec![
            RawNode::new("/"),
            RawNode::new("/boots"),
            RawNode::new("/boots/hiking"),
            RawNode::new("/sale"),
            RawNode::new("/sale/hiking-boots"),
        ]);
        let analysis = HierarchyAnalyzer::default().analyze(&h);

        let sale_hiking = id(&h, "/sale/hiking-boots");
        let links = analysis.related(sale_hiking, Some(RelationshipKind::CrossLink));
        let targets: HashSet<NodeId> = links.iter().map(|r| r.other(sale_hiking)).collect();
        assert!(targets.contains(&id(&h, "/boots")));
        assert!(targets.contains(&id(&h, "/boots/hiking")));
        // /sale is an ancestor, never a cross-link.
        assert!(!targets.contains(&id(&h, "/sale")));

        // /boots/hiking contains "boots" but /boots is its parent.
        let boots_hiking = id(&h, "/boots/hiking");
        assert!(
            analysis
                .related(boots_hiking, Some(RelationshipKind::CrossLink))
                .iter()
                .all(|r| r.other(boots_hiking) != id(&h, "/boots"))
        );
    }

    #[test]
    fn short_slugs_never_cross_link() {
        let h = build(vec![
            RawNode::new("/"),
            RawNode::new("/tv"),
            RawNode::new("/deals/tv-stands"),
        ]);
        let analysis = HierarchyAnalyzer::default().analyze(&h);
        assert_eq!(analysis.count(RelationshipKind::CrossLink), 0);
    }

    #[test]
    fn isolated_nodes_are_orphans_but_roots_are_not() {
        let h = build(vec![
            RawNode::new("https://shop.example/"),
            RawNode::new("/lonely"),
            RawNode::new("not a valid url"),
        ]);
        let analysis = HierarchyAnalyzer::default().analyze(&h);
        let orphans: HashSet<NodeId> = analysis
            .of_kind(RelationshipKind::Orphan)
            .map(|r| r.source_id)
            .collect();
        assert_eq!(
            orphans,
            HashSet::from([id(&h, "/lonely"), id(&h, "not a valid url")])
        );

        let designated = HierarchyAnalyzer::default()
            .with_designated_root("/lonely")
            .analyze(&h);
        assert_eq!(designated.count(RelationshipKind::Orphan), 1);
    }
}
