//! Deterministic thread-tree rebuild.
//!
//! Materializes a thread document's member set into a forest of
//! [`ThreadNode`]s: real nodes for members, placeholder nodes for
//! referenced-but-absent ancestors, parent links along each member's
//! reference chain, and a cycle guard for contradictory reference data.
//!
//! The rebuild is a pure function of the member set. Members are iterated
//! in key order and every guard breaks ties deterministically, so two
//! documents with equal membership always materialize the same forest;
//! arrival order cannot leak into the tree.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{ThreadMember, ThreadNode};

/// A materialized thread forest.
///
/// `roots` lists parentless node ids ordered by effective timestamp (a
/// placeholder root borrows the earliest timestamp of its real
/// descendants), then id. The forest converges to a single rooted tree
/// once every referenced ancestor has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadTree {
    pub nodes: BTreeMap<String, ThreadNode>,
    pub roots: Vec<String>,
}

impl ThreadTree {
    /// Every node id in the forest, placeholders included. These are the
    /// ids the store indexes for reconciliation lookups.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Root-to-leaf id chains across the whole forest, in root order.
    pub fn chains(&self) -> Vec<Vec<String>> {
        let mut chains = Vec::new();
        for root in &self.roots {
            self.collect_chains(root, &mut Vec::new(), &mut chains);
        }
        chains
    }

    fn collect_chains(&self, id: &str, path: &mut Vec<String>, chains: &mut Vec<Vec<String>>) {
        path.push(id.to_string());
        let children = self
            .nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[]);
        if children.is_empty() {
            chains.push(path.clone());
        } else {
            for child in children {
                self.collect_chains(child, path, chains);
            }
        }
        path.pop();
    }

    /// Earliest real timestamp at or below `id`.
    fn effective_timestamp(&self, id: &str) -> Option<DateTime<Utc>> {
        let node = self.nodes.get(id)?;
        let mut earliest = node.timestamp;
        for child in &node.children {
            let child_ts = self.effective_timestamp(child);
            earliest = match (earliest, child_ts) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        earliest
    }
}

/// Rebuild the forest for a member set.
pub fn rebuild(members: &BTreeMap<String, ThreadMember>) -> ThreadTree {
    let mut nodes: BTreeMap<String, ThreadNode> = BTreeMap::new();

    // Real nodes for members, placeholders for referenced ancestors.
    for (id, member) in members {
        nodes.insert(
            id.clone(),
            ThreadNode {
                message_id: id.clone(),
                fingerprint: Some(member.fingerprint.clone()),
                parent_message_id: None,
                children: Vec::new(),
                timestamp: Some(member.timestamp),
            },
        );
    }
    for member in members.values() {
        for ancestor in &member.parent_refs {
            nodes.entry(ancestor.clone()).or_insert_with(|| ThreadNode {
                message_id: ancestor.clone(),
                fingerprint: None,
                parent_message_id: None,
                children: Vec::new(),
                timestamp: None,
            });
        }
    }

    // Link each member's reference chain oldest-first, then the member
    // under its nearest ancestor. Chaining every referenced ancestor puts
    // interior late arrivals in the right position when they materialize.
    for (id, member) in members {
        let mut prev_ref: Option<&String> = None;
        for ancestor in &member.parent_refs {
            if let Some(prev) = prev_ref {
                link_if_no_parent(&mut nodes, ancestor, prev);
            }
            prev_ref = Some(ancestor);
        }
        if let Some(nearest) = prev_ref {
            link_if_no_parent(&mut nodes, id, nearest);
        }
    }

    // Canonical child order.
    for node in nodes.values_mut() {
        node.children.sort();
    }

    let mut tree = ThreadTree {
        nodes,
        roots: Vec::new(),
    };
    let mut roots: Vec<String> = tree
        .nodes
        .values()
        .filter(|n| n.parent_message_id.is_none())
        .map(|n| n.message_id.clone())
        .collect();
    roots.sort_by_key(|id| (tree.effective_timestamp(id), id.clone()));
    tree.roots = roots;
    tree
}

/// Link `child` under `parent` unless the child is already linked or the
/// link would corrupt the forest.
///
/// On a would-be cycle the guard degrades gracefully instead of erroring:
/// the later-timestamped endpoint loses its parent link and becomes a new
/// provisional root (ties break by message id). Placeholder endpoints have
/// no timestamp to compare, so a cyclic link against one is skipped.
fn link_if_no_parent(nodes: &mut BTreeMap<String, ThreadNode>, child: &str, parent: &str) {
    if child == parent {
        return;
    }

    if nodes
        .get(child)
        .map(|n| n.parent_message_id.is_some())
        .unwrap_or(false)
    {
        return;
    }

    if would_create_cycle(nodes, child, parent) {
        let child_ts = nodes.get(child).and_then(|n| n.timestamp);
        let parent_ts = nodes.get(parent).and_then(|n| n.timestamp);
        let (Some(child_ts), Some(parent_ts)) = (child_ts, parent_ts) else {
            return;
        };

        let parent_is_later =
            (parent_ts, parent) > (child_ts, child);
        if !parent_is_later {
            // The child is the later message: leave it detached as a new
            // provisional root.
            return;
        }

        // The parent is the later message: cut its own parent link (the
        // closing edge of the cycle path) and let it re-root, then the
        // child link below is safe.
        log::warn!(
            "cycle between {} and {}: detaching {} as new provisional root",
            child,
            parent,
            parent
        );
        detach(nodes, parent);
    }

    if let Some(node) = nodes.get_mut(child) {
        node.parent_message_id = Some(parent.to_string());
    }
    if let Some(node) = nodes.get_mut(parent) {
        if !node.children.contains(&child.to_string()) {
            node.children.push(child.to_string());
        }
    }
}

/// Remove a node's parent link, making it a root.
fn detach(nodes: &mut BTreeMap<String, ThreadNode>, id: &str) {
    let Some(parent_id) = nodes.get(id).and_then(|n| n.parent_message_id.clone()) else {
        return;
    };
    if let Some(parent) = nodes.get_mut(&parent_id) {
        parent.children.retain(|c| c != id);
    }
    if let Some(node) = nodes.get_mut(id) {
        node.parent_message_id = None;
    }
}

/// Whether linking `child` under `parent` would make a node its own
/// ancestor. Walks up from `parent`; finding `child` (or revisiting any
/// node) means the link must not be made as-is.
fn would_create_cycle(nodes: &BTreeMap<String, ThreadNode>, child: &str, parent: &str) -> bool {
    let mut visited = HashSet::new();
    let mut current = Some(parent.to_string());

    while let Some(id) = current {
        if !visited.insert(id.clone()) {
            return true;
        }
        if id == child {
            return true;
        }
        current = nodes.get(&id).and_then(|n| n.parent_message_id.clone());
    }

    false
}
