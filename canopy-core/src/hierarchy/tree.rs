// Node arena with id and URL index tables.
//
// `parent_id` is authoritative; `children` lists are derived from it. Every
// traversal carries a visited set so malformed parent links (cycles) end in a
// warning instead of a hang.

use std::collections::{HashMap, HashSet};

use crate::types::{Node, NodeId};

use super::BuildWarning;

/// Flat storage for a category tree.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    by_url: HashMap<String, NodeId>,
}

impl Hierarchy {
    /// Build an arena from nodes whose `parent_id` fields are authoritative.
    ///
    /// `children` lists are rebuilt from the parent links. A repeated id keeps
    /// its first occurrence. Depth and sibling positions are left as supplied;
    /// call [`assign_depths`](Self::assign_depths) and
    /// [`assign_positions`](Self::assign_positions) to recompute them.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut arena = Self::default();
        for mut node in nodes {
            if arena.index.contains_key(&node.id) {
                continue;
            }
            node.children.clear();
            arena
                .by_url
                .entry(node.normalized_url.clone())
                .or_insert(node.id);
            arena.index.insert(node.id, arena.nodes.len());
            arena.nodes.push(node);
        }
        arena.link_children();
        arena
    }

    fn link_children(&mut self) {
        let links: Vec<(usize, NodeId)> = self
            .nodes
            .iter()
            .filter_map(|n| {
                let parent = n.parent_id?;
                let &parent_idx = self.index.get(&parent)?;
                Some((parent_idx, n.id))
            })
            .collect();
        for (parent_idx, child) in links {
            self.nodes[parent_idx].children.push(child);
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn get_by_url(&self, normalized_url: &str) -> Option<&Node> {
        self.by_url.get(normalized_url).and_then(|&id| self.get(id))
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map_or(&[], |n| n.children.as_slice())
    }

    pub fn parent_of(&self, id: NodeId) -> Option<&Node> {
        self.get(id)
            .and_then(|n| n.parent_id)
            .and_then(|p| self.get(p))
    }

    fn url_of(&self, id: NodeId) -> &str {
        self.get(id).map_or("", |n| n.normalized_url.as_str())
    }

    /// Nodes with no parent, or whose parent is not in the arena, sorted by URL.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots: Vec<&Node> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id.is_none_or(|p| !self.index.contains_key(&p)))
            .collect();
        roots.sort_by(|a, b| a.normalized_url.cmp(&b.normalized_url));
        roots.into_iter().map(|n| n.id).collect()
    }

    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Ancestors of `id`, nearest first. Stops at the first repeat.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = self.get(id).and_then(|n| n.parent_id);
        while let Some(parent) = current {
            if !self.contains(parent) || !seen.insert(parent) {
                break;
            }
            out.push(parent);
            current = self.get(parent).and_then(|n| n.parent_id);
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> bool {
        self.ancestors(of).contains(&ancestor)
    }

    /// Sort every child list (and the root list) by normalized URL and record
    /// each node's zero-based `position` among its siblings.
    pub fn assign_positions(&mut self) {
        let sorted: Vec<Vec<NodeId>> = self
            .nodes
            .iter()
            .map(|node| {
                let mut kids = node.children.clone();
                kids.sort_by(|a, b| self.url_of(*a).cmp(self.url_of(*b)));
                kids.dedup();
                kids
            })
            .collect();

        for (parent_idx, kids) in sorted.into_iter().enumerate() {
            for (pos, kid) in kids.iter().enumerate() {
                if let Some(&kid_idx) = self.index.get(kid) {
                    self.nodes[kid_idx].position = to_u32(pos);
                }
            }
            self.nodes[parent_idx].children = kids;
        }

        for (pos, root) in self.roots().into_iter().enumerate() {
            if let Some(&idx) = self.index.get(&root) {
                self.nodes[idx].position = to_u32(pos);
            }
        }
    }

    /// Recompute `depth` for every node by walking down from the roots.
    ///
    /// Nodes that no root reaches sit on or below a parent cycle. Each such
    /// cycle is walked once from one of its members and reported once; the
    /// walk stops where it would revisit a node.
    pub fn assign_depths(&mut self) -> Vec<BuildWarning> {
        let mut visited: HashSet<NodeId> = HashSet::with_capacity(self.nodes.len());
        let mut warnings = Vec::new();

        for root in self.roots() {
            self.walk_depths(root, &mut visited, &mut warnings);
        }

        for idx in self.indices_by_url() {
            let id = self.nodes[idx].id;
            if visited.contains(&id) {
                continue;
            }
            let entry = self.cycle_entry(id);
            self.walk_depths(entry, &mut visited, &mut warnings);
            if !visited.contains(&id) {
                // Not below the cycle we just walked; start from the node itself.
                self.walk_depths(id, &mut visited, &mut warnings);
            }
        }

        warnings
    }

    fn walk_depths(
        &mut self,
        start: NodeId,
        visited: &mut HashSet<NodeId>,
        warnings: &mut Vec<BuildWarning>,
    ) {
        if !visited.insert(start) {
            return;
        }
        let mut stack = vec![(start, 0u32)];
        while let Some((id, depth)) = stack.pop() {
            let Some(&idx) = self.index.get(&id) else {
                continue;
            };
            self.nodes[idx].depth = depth;
            let children = self.nodes[idx].children.clone();
            for child in children {
                if visited.insert(child) {
                    stack.push((child, depth + 1));
                } else {
                    warnings.push(BuildWarning::CircularReference {
                        cycle: self.cycle_members(id, child),
                    });
                }
            }
        }
    }

    /// Follow parent links from `id` until one repeats; that node is on the cycle.
    fn cycle_entry(&self, id: NodeId) -> NodeId {
        let mut seen = HashSet::new();
        let mut current = id;
        loop {
            if !seen.insert(current) {
                return current;
            }
            match self.get(current).and_then(|n| n.parent_id) {
                Some(parent) if self.contains(parent) => current = parent,
                _ => return id,
            }
        }
    }

    /// URLs on the loop closed by the edge `parent -> child`, sorted.
    fn cycle_members(&self, parent: NodeId, child: NodeId) -> Vec<String> {
        let mut members = vec![self.url_of(child).to_string()];
        let mut current = Some(parent);
        let mut steps = 0;
        while let Some(id) = current {
            if id == child || steps > self.nodes.len() {
                break;
            }
            members.push(self.url_of(id).to_string());
            current = self.get(id).and_then(|n| n.parent_id);
            steps += 1;
        }
        members.sort();
        members.dedup();
        members
    }

    fn indices_by_url(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|&a, &b| self.nodes[a].normalized_url.cmp(&self.nodes[b].normalized_url));
        order
    }

    /// Depth-first search with an explicit recursion stack; every back edge
    /// (an edge into a node still on the stack) is a cycle.
    pub fn detect_cycles(&self) -> Vec<BuildWarning> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unseen,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unseen; self.nodes.len()];
        let mut found: Vec<BuildWarning> = Vec::new();

        for start in self.indices_by_url() {
            if marks[start] != Mark::Unseen {
                continue;
            }
            marks[start] = Mark::OnStack;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node_idx, next) = *frame;
                let Some(&child) = self.nodes[node_idx].children.get(next) else {
                    marks[node_idx] = Mark::Done;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                let Some(&child_idx) = self.index.get(&child) else {
                    continue;
                };
                match marks[child_idx] {
                    Mark::Unseen => {
                        marks[child_idx] = Mark::OnStack;
                        stack.push((child_idx, 0));
                    }
                    Mark::OnStack => {
                        let warning = BuildWarning::CircularReference {
                            cycle: self.cycle_members(self.nodes[node_idx].id, child),
                        };
                        if !found.contains(&warning) {
                            found.push(warning);
                        }
                    }
                    Mark::Done => {}
                }
            }
        }

        found
    }

    /// Nodes whose `parent_id` names a node that is not in the arena.
    pub fn detect_orphans(&self) -> Vec<BuildWarning> {
        self.nodes
            .iter()
            .filter_map(|n| {
                let parent = n.parent_id?;
                (!self.contains(parent)).then(|| BuildWarning::OrphanedNode {
                    url: n.normalized_url.clone(),
                    missing_parent: parent,
                })
            })
            .collect()
    }

    /// Warn once if the deepest node exceeds `limit`.
    pub fn detect_excess_depth(&self, limit: u32) -> Option<BuildWarning> {
        let deepest = self.nodes.iter().max_by_key(|n| n.depth)?;
        (deepest.depth > limit).then(|| BuildWarning::DeepHierarchy {
            url: deepest.normalized_url.clone(),
            depth: deepest.depth,
            limit,
        })
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
