use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub type NodeId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: NodeId,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_children: Option<bool>,
}

impl TreeNode {
    /// `has_children: None` means the server did not say; such nodes may
    /// still have children.
    pub fn may_have_children(&self) -> bool {
        self.has_children != Some(false)
    }
}

/// One line of the rendered tree, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleRow {
    pub node: TreeNode,
    pub depth: usize,
    pub expanded: bool,
}

/// Client-side view of the hierarchy. Child lists are populated at most once
/// per parent until evicted; expansion is tracked independently of them.
#[derive(Debug, Default, Clone)]
pub struct TreeCache {
    nodes: HashMap<NodeId, TreeNode>,
    children: HashMap<NodeId, Vec<NodeId>>,
    expanded: HashSet<NodeId>,
    loading: HashSet<NodeId>,
    root: Option<NodeId>,
}

impl TreeCache {
    pub fn root(&self) -> Option<&TreeNode> {
        self.root.and_then(|id| self.nodes.get(&id))
    }

    pub fn set_root(&mut self, node: TreeNode) {
        self.root = Some(node.id);
        self.upsert(node);
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn upsert(&mut self, node: TreeNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn child_ids(&self, parent: NodeId) -> Option<&[NodeId]> {
        self.children.get(&parent).map(Vec::as_slice)
    }

    pub fn children_of(&self, parent: NodeId) -> Option<Vec<TreeNode>> {
        let ids = self.children.get(&parent)?;
        Some(
            ids.iter()
                .filter_map(|id| self.nodes.get(id).cloned())
                .collect(),
        )
    }

    /// Merges `nodes` and records them, in order, as the children of
    /// `parent`.
    pub fn set_children(&mut self, parent: NodeId, nodes: Vec<TreeNode>) {
        let ids = nodes.iter().map(|node| node.id).collect::<Vec<_>>();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.has_children = Some(!ids.is_empty());
        }
        for node in nodes {
            self.upsert(node);
        }
        self.children.insert(parent, ids);
    }

    /// Appends to an already-loaded child list. Returns `false` when the
    /// parent's children were never fetched.
    pub fn append_child(&mut self, parent: NodeId, node: TreeNode) -> bool {
        let id = node.id;
        self.upsert(node);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.has_children = Some(true);
        }
        match self.children.get_mut(&parent) {
            Some(ids) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
                true
            }
            None => false,
        }
    }

    pub fn evict_children(&mut self, parent: NodeId) {
        self.children.remove(&parent);
    }

    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.expanded.contains(&id)
    }

    pub fn expand(&mut self, id: NodeId) {
        self.expanded.insert(id);
    }

    pub fn collapse(&mut self, id: NodeId) {
        self.expanded.remove(&id);
    }

    pub fn collapse_all(&mut self) {
        self.expanded.clear();
    }

    pub fn expanded_count(&self) -> usize {
        self.expanded.len()
    }

    pub fn is_loading(&self, id: NodeId) -> bool {
        self.loading.contains(&id)
    }

    pub(crate) fn set_loading(&mut self, id: NodeId, loading: bool) {
        if loading {
            self.loading.insert(id);
        } else {
            self.loading.remove(&id);
        }
    }

    /// Depth-first walk from the root through expanded nodes whose children
    /// are cached.
    pub fn visible_rows(&self) -> Vec<VisibleRow> {
        let mut rows = Vec::new();
        let Some(root) = self.root else {
            return rows;
        };
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let expanded = self.expanded.contains(&id);
            rows.push(VisibleRow {
                node: node.clone(),
                depth,
                expanded,
            });
            if !expanded {
                continue;
            }
            if let Some(children) = self.children.get(&id) {
                for child in children.iter().rev() {
                    stack.push((*child, depth + 1));
                }
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, parent: Option<NodeId>) -> TreeNode {
        TreeNode {
            id,
            code: format!("N{id}"),
            name: format!("Node {id}"),
            level: parent.map_or(0, |_| 1),
            path: format!("/{id}"),
            parent_id: parent,
            sort_order: None,
            version: Some(1),
            is_active: Some(true),
            has_children: None,
        }
    }

    #[test]
    fn deserializes_camel_case_with_optional_fields() {
        let parsed: TreeNode = serde_json::from_str(
            r#"{"id":42,"code":"FIN","name":"Finance","level":2,"path":"/1/7/42",
                "parentId":7,"version":3,"hasChildren":false}"#,
        )
        .expect("node");
        assert_eq!(parsed.parent_id, Some(7));
        assert_eq!(parsed.version, Some(3));
        assert_eq!(parsed.is_active, None);
        assert!(!parsed.may_have_children());
    }

    #[test]
    fn expansion_is_independent_of_children() {
        let mut cache = TreeCache::default();
        cache.set_root(node(1, None));
        cache.expand(1);
        assert!(cache.is_expanded(1));
        assert!(cache.child_ids(1).is_none());

        cache.set_children(1, vec![node(2, Some(1))]);
        cache.collapse(1);
        assert_eq!(cache.child_ids(1), Some(&[2][..]));
        assert_eq!(cache.node(1).and_then(|n| n.has_children), Some(true));
    }

    #[test]
    fn append_child_requires_loaded_list() {
        let mut cache = TreeCache::default();
        cache.set_root(node(1, None));
        assert!(!cache.append_child(1, node(5, Some(1))));
        assert!(cache.node(5).is_some());

        cache.set_children(1, vec![node(2, Some(1))]);
        assert!(cache.append_child(1, node(6, Some(1))));
        assert_eq!(cache.child_ids(1), Some(&[2, 6][..]));
    }

    #[test]
    fn visible_rows_follow_expansion_in_order() {
        let mut cache = TreeCache::default();
        cache.set_root(node(1, None));
        cache.set_children(1, vec![node(2, Some(1)), node(3, Some(1))]);
        cache.set_children(2, vec![node(4, Some(2))]);
        cache.expand(1);

        let ids = |cache: &TreeCache| {
            cache
                .visible_rows()
                .into_iter()
                .map(|row| (row.node.id, row.depth))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&cache), vec![(1, 0), (2, 1), (3, 1)]);

        cache.expand(2);
        assert_eq!(ids(&cache), vec![(1, 0), (2, 1), (4, 2), (3, 1)]);

        cache.collapse_all();
        assert_eq!(ids(&cache), vec![(1, 0)]);
    }
}
