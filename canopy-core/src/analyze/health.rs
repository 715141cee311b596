// Structural health metrics from one cycle-safe depth-first pass.
#![allow(clippy::cast_precision_loss)]

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::hierarchy::{DEFAULT_MAX_DEPTH_WARNING, Hierarchy};
use crate::types::{Node, NodeId};

pub const DEFAULT_UNBALANCED_CHILDREN: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub total_nodes: usize,
    pub orphan_count: usize,
    pub duplicate_count: usize,
    pub max_depth: u32,
    pub avg_children: f64,
    /// Nodes with more children than the limit.
    pub unbalanced: Vec<NodeId>,
    /// Nodes no root reaches, e.g. members of a parent cycle. Whole-forest scans only.
    pub unreachable: Vec<NodeId>,
    pub cycles_detected: usize,
    /// 1.0 for a clean tree, lower as problems accumulate.
    pub score: f64,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.orphan_count == 0
            && self.duplicate_count == 0
            && self.cycles_detected == 0
            && self.unreachable.is_empty()
    }
}

/// Health of the subtree under `root`, or of the whole forest when `root` is `None`.
///
/// Never fails on cyclic input: every node is expanded at most once.
pub fn analyze_health(hierarchy: &Hierarchy, root: Option<NodeId>) -> HealthReport {
    analyze_health_with(hierarchy, root, DEFAULT_UNBALANCED_CHILDREN)
}

pub fn analyze_health_with(
    hierarchy: &Hierarchy,
    root: Option<NodeId>,
    unbalanced_limit: usize,
) -> HealthReport {
    let mut walk = Walk {
        hierarchy,
        visited: HashSet::with_capacity(hierarchy.len()),
        urls: HashSet::new(),
        titles: HashSet::new(),
        report: HealthReport::default(),
        child_links: 0,
        unbalanced_limit,
    };

    match root {
        Some(root) => walk.descend(root),
        None => {
            for r in hierarchy.roots() {
                walk.descend(r);
            }
            let mut leftover: Vec<&Node> = hierarchy
                .iter()
                .filter(|n| !walk.visited.contains(&n.id))
                .collect();
            leftover.sort_by(|a, b| a.normalized_url.cmp(&b.normalized_url));
            walk.report.unreachable = leftover.iter().map(|n| n.id).collect();
            for node in leftover {
                walk.descend(node.id);
            }
        }
    }

    let mut report = walk.report;
    report.total_nodes = walk.visited.len();
    report.avg_children = if report.total_nodes == 0 {
        0.0
    } else {
        walk.child_links as f64 / report.total_nodes as f64
    };
    report.unbalanced.sort();
    report.score = score(&report);
    report
}

struct Walk<'a> {
    hierarchy: &'a Hierarchy,
    visited: HashSet<NodeId>,
    urls: HashSet<&'a str>,
    titles: HashSet<String>,
    report: HealthReport,
    child_links: usize,
    unbalanced_limit: usize,
}

impl<'a> Walk<'a> {
    fn descend(&mut self, start: NodeId) {
        if !self.visited.insert(start) {
            return;
        }
        let hierarchy = self.hierarchy;
        let mut stack = vec![(start, 0u32)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = hierarchy.get(id) else {
                continue;
            };
            self.visit(node, depth);
            for &child in node.children.iter().rev() {
                if self.visited.insert(child) {
                    stack.push((child, depth + 1));
                } else {
                    self.report.cycles_detected += 1;
                }
            }
        }
    }

    fn visit(&mut self, node: &'a Node, depth: u32) {
        self.report.max_depth = self.report.max_depth.max(depth);
        self.child_links += node.children.len();

        if node.children.len() > self.unbalanced_limit {
            self.report.unbalanced.push(node.id);
        }
        if self.hierarchy.parent_of(node.id).is_none()
            && node.children.is_empty()
            && !node.is_domain_root()
        {
            self.report.orphan_count += 1;
        }

        let url_seen = !self.urls.insert(node.normalized_url.as_str());
        let title_seen = node
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .is_some_and(|t| !self.titles.insert(t.to_lowercase()));
        if url_seen || title_seen {
            self.report.duplicate_count += 1;
        }
    }
}

fn score(report: &HealthReport) -> f64 {
    if report.total_nodes == 0 {
        return 1.0;
    }
    let n = report.total_nodes as f64;
    let mut score = 1.0;
    score -= 0.3 * (report.unreachable.len() as f64 / n);
    score -= 0.2 * (report.orphan_count as f64 / n);
    score -= 0.2 * (report.duplicate_count as f64 / n);
    score -= 0.1 * (report.unbalanced.len() as f64 / n);
    if report.cycles_detected > 0 {
        score -= 0.1;
    }
    if report.max_depth > DEFAULT_MAX_DEPTH_WARNING {
        score -= 0.1;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{BuildOptions, HierarchyBuilder};
    use crate::types::RawNode;

    #[test]
    fn clean_tree_is_healthy() {
        let records: Vec<RawNode> = ["/", "/shoes", "/shoes/running", "/shirts"]
            .into_iter()
            .map(RawNode::new)
            .collect();
        let h = HierarchyBuilder::build(&records, &BuildOptions::default()).hierarchy;

        let report = analyze_health(&h, None);
        assert!(report.is_healthy(), "{report:?}");
        assert_eq!(report.total_nodes, 4);
        assert_eq!(report.max_depth, 2);
        assert!((report.avg_children - 0.75).abs() < 1e-12);
        assert!((report.score - 1.0).abs() < f64::EPSILON);

        let shoes = h.get_by_url("/shoes").unwrap().id;
        let subtree = analyze_health(&h, Some(shoes));
        assert_eq!(subtree.total_nodes, 2);
        assert_eq!(subtree.max_depth, 1);
    }

    #[test]
    fn wide_nodes_are_unbalanced() {
        let mut records = vec![RawNode::new("/")];
        records.extend((0..25).map(|i| RawNode::new(format!("/c{i}"))));
        let h = HierarchyBuilder::build(&records, &BuildOptions::default()).hierarchy;

        let report = analyze_health(&h, None);
        assert_eq!(report.unbalanced, vec![h.get_by_url("/").unwrap().id]);
        assert!(report.score < 1.0);
    }

    #[test]
    fn cycles_are_reported_not_followed() {
        let mut a = Node::new("/a");
        let mut b = Node::new("/b");
        a.parent_id = Some(b.id);
        b.parent_id = Some(a.id);
        let lonely = Node::new("/lonely");
        let h = Hierarchy::from_nodes([a, b, lonely]);

        let report = analyze_health(&h, None);
        assert_eq!(report.total_nodes, 3);
        assert_eq!(report.unreachable.len(), 2);
        assert_eq!(report.cycles_detected, 1);
        assert_eq!(report.orphan_count, 1);
        assert!(!report.is_healthy());
        assert!(report.score < 1.0);
    }

    #[test]
    fn duplicate_titles_are_counted() {
        let records = vec![
            RawNode::new("/"),
            RawNode::new("/a").with_title("Boots"),
            RawNode::new("/b").with_title("boots"),
        ];
        let h = HierarchyBuilder::build(&records, &BuildOptions::default()).hierarchy;
        assert_eq!(analyze_health(&h, None).duplicate_count, 1);
    }
}
