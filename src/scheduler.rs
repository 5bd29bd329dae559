//! Weighted dependency scheduler (RFC 7540 §5.3).
//!
//! Streams hang off a rooted tree whose nodes live in an arena and are
//! addressed by handle, so a node can outlive its stream: closed streams
//! keep their slot in the tree for a while and late PRIORITY references can
//! still attach beneath them. Parent links are handles, never pointers.
//!
//! Bandwidth allocation: an *active* node is one with pending egress. A
//! node sends before any of its descendants; among siblings, selection is
//! proportional to weight using deterministic smooth weighted round-robin
//! (each eligible child accumulates its weight, the largest accumulator
//! wins and is debited by the eligible total).

use crate::StreamId;

/// Weight assigned when the peer names an unknown dependency
/// (RFC 7540 §5.3.5).
pub const DEFAULT_WEIGHT: u16 = 16;

/// Weight reserved for critical server pushes; above the protocol's 256
/// maximum so PRIORITY frames can never demote such a node.
pub const CRITICAL_PUSH_WEIGHT: u16 = 257;

/// Handle to a scheduler node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    weight: u16,
    stream: Option<StreamId>,
    active_self: bool,
    /// Active nodes in this subtree, including self.
    active_count: usize,
    /// Smooth-WRR accumulator, meaningful only while competing.
    effective: i64,
    open: bool,
}

pub struct Scheduler {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
}

impl Scheduler {
    pub fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            weight: 0,
            stream: None,
            active_self: false,
            active_count: 0,
            effective: 0,
            open: true,
        };
        Self {
            nodes: vec![root],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = node;
                id
            }
            None => {
                let id = NodeId(self.nodes.len());
                self.nodes.push(node);
                id
            }
        }
    }

    pub fn is_open(&self, id: NodeId) -> bool {
        self.node(id).open
    }

    pub fn weight(&self, id: NodeId) -> u16 {
        self.node(id).weight
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn stream(&self, id: NodeId) -> Option<StreamId> {
        self.node(id).stream
    }

    pub fn is_active(&self, id: NodeId) -> bool {
        self.node(id).active_self
    }

    pub fn has_active(&self) -> bool {
        self.node(self.root).active_count > 0
    }

    /// Walk `from`'s ancestors (excluding `from`), adjusting their
    /// active-subtree counters.
    fn bump_ancestors(&mut self, from: NodeId, delta: isize) {
        let mut cur = self.node(from).parent;
        while let Some(id) = cur {
            let n = self.node_mut(id);
            n.active_count = (n.active_count as isize + delta) as usize;
            cur = n.parent;
        }
    }

    fn is_ancestor(&self, candidate: NodeId, of: NodeId) -> bool {
        let mut cur = self.node(of).parent;
        while let Some(id) = cur {
            if id == candidate {
                return true;
            }
            cur = self.node(id).parent;
        }
        false
    }

    fn attach(&mut self, id: NodeId, parent: NodeId, exclusive: bool) {
        // Active egress the node carries in from outside this subtree; any
        // children adopted below are already counted along the ancestor
        // chain and must not be re-added.
        let brought = self.node(id).active_count;
        if exclusive {
            // The new node adopts all of the parent's current children
            // (RFC 7540 §5.3.3).
            let adopted = std::mem::take(&mut self.node_mut(parent).children);
            let moved_active: usize = adopted
                .iter()
                .map(|&c| self.node(c).active_count)
                .sum();
            for &child in &adopted {
                self.node_mut(child).parent = Some(id);
            }
            let n = self.node_mut(id);
            n.children.extend(adopted);
            n.active_count += moved_active;
        }
        self.node_mut(id).parent = Some(parent);
        self.node_mut(parent).children.push(id);
        if brought > 0 {
            self.bump_ancestors(id, brought as isize);
        }
    }

    fn detach(&mut self, id: NodeId) {
        let count = self.node(id).active_count;
        if count > 0 {
            self.bump_ancestors(id, -(count as isize));
        }
        if let Some(parent) = self.node(id).parent {
            let siblings = &mut self.node_mut(parent).children;
            siblings.retain(|&c| c != id);
        }
        self.node_mut(id).parent = None;
    }

    /// Insert a node for `stream` under `parent`.
    pub fn open(
        &mut self,
        parent: NodeId,
        stream: Option<StreamId>,
        weight: u16,
        exclusive: bool,
    ) -> NodeId {
        debug_assert!((1..=CRITICAL_PUSH_WEIGHT).contains(&weight));
        let id = self.alloc(Node {
            parent: None,
            children: Vec::new(),
            weight,
            stream,
            active_self: false,
            active_count: 0,
            effective: 0,
            open: true,
        });
        self.attach(id, parent, exclusive);
        id
    }

    /// Move an existing node under a new parent, updating weight and
    /// exclusivity. Re-parenting under one's own descendant first moves
    /// that descendant up to the node's current position (RFC 7540 §5.3.3).
    pub fn rebind(&mut self, id: NodeId, new_parent: NodeId, weight: u16, exclusive: bool) {
        debug_assert!(id != self.root);
        if new_parent == id {
            return;
        }
        if self.is_ancestor(id, new_parent) {
            let grandparent = self.node(id).parent.expect("non-root node has a parent");
            self.detach(new_parent);
            self.attach(new_parent, grandparent, false);
        }
        self.detach(id);
        self.node_mut(id).weight = weight;
        self.attach(id, new_parent, exclusive);
    }

    /// Remove a node. Its children are adopted by its parent, keeping
    /// their weights.
    pub fn close(&mut self, id: NodeId) {
        debug_assert!(id != self.root);
        debug_assert!(self.node(id).open);
        if self.node(id).active_self {
            self.deactivate(id);
        }
        let parent = self.node(id).parent.expect("non-root node has a parent");
        let children = std::mem::take(&mut self.node_mut(id).children);
        let moved_active: usize = children.iter().map(|&c| self.node(c).active_count).sum();
        self.node_mut(id).active_count -= moved_active;
        for &child in &children {
            self.node_mut(child).parent = Some(parent);
        }
        self.detach(id);
        // The children never left `parent`'s subtree, so the counters along
        // the ancestor chain are already correct.
        self.node_mut(parent).children.extend(children);
        let n = self.node_mut(id);
        n.open = false;
        n.stream = None;
        self.free.push(id);
    }

    /// Mark a node as having pending egress.
    pub fn activate(&mut self, id: NodeId) {
        let n = self.node_mut(id);
        if n.active_self {
            return;
        }
        n.active_self = true;
        n.active_count += 1;
        n.effective = 0;
        self.bump_ancestors(id, 1);
    }

    pub fn deactivate(&mut self, id: NodeId) {
        let n = self.node_mut(id);
        if !n.active_self {
            return;
        }
        n.active_self = false;
        n.active_count -= 1;
        self.bump_ancestors(id, -1);
    }

    /// Pick the next sender: descend from the root, stopping at the first
    /// active node on the path (a parent sends before its descendants);
    /// among siblings whose subtrees hold active nodes, pick proportionally
    /// to weight. Returns `None` when nothing is active.
    pub fn pick_active(&mut self) -> Option<NodeId> {
        if self.node(self.root).active_count == 0 {
            return None;
        }
        let mut cur = self.root;
        loop {
            if self.node(cur).active_self {
                return Some(cur);
            }
            let eligible: Vec<NodeId> = self
                .node(cur)
                .children
                .iter()
                .copied()
                .filter(|&c| self.node(c).active_count > 0)
                .collect();
            debug_assert!(!eligible.is_empty());
            let total: i64 = eligible.iter().map(|&c| i64::from(self.node(c).weight)).sum();
            let mut winner = eligible[0];
            let mut best = i64::MIN;
            for &c in &eligible {
                let n = self.node_mut(c);
                n.effective += i64::from(n.weight);
                if n.effective > best {
                    best = n.effective;
                    winner = c;
                }
            }
            self.node_mut(winner).effective -= total;
            cur = winner;
        }
    }

    /// Descend along the heaviest children from the root and return the
    /// deepest node whose weight is at least `weight`. On a chain-shaped
    /// tree this finds the position at which a stream of that weight would
    /// be handled no later than lighter ones.
    pub fn find_parent_by_weight(&self, weight: u16) -> NodeId {
        let mut cur = self.root;
        loop {
            let heaviest = self
                .node(cur)
                .children
                .iter()
                .copied()
                .max_by_key(|&c| self.node(c).weight);
            match heaviest {
                Some(child) if self.node(child).weight >= weight => cur = child,
                _ => return cur,
            }
        }
    }

    /// Number of live (open, non-root) nodes; diagnostics only.
    pub fn open_nodes(&self) -> usize {
        self.nodes
            .iter()
            .skip(1)
            .filter(|n| n.open)
            .count()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(s: &mut Scheduler, rounds: usize) -> Vec<StreamId> {
        let mut order = Vec::new();
        for _ in 0..rounds {
            let Some(node) = s.pick_active() else { break };
            order.push(s.stream(node).unwrap());
        }
        order
    }

    #[test]
    fn weighted_selection_is_proportional() {
        let mut s = Scheduler::new();
        let root = s.root();
        let a = s.open(root, Some(1), 30, false);
        let b = s.open(root, Some(3), 10, false);
        s.activate(a);
        s.activate(b);

        let order = drain(&mut s, 40);
        let picked_a = order.iter().filter(|&&id| id == 1).count();
        let picked_b = order.iter().filter(|&&id| id == 3).count();
        assert_eq!(picked_a, 30);
        assert_eq!(picked_b, 10);
    }

    #[test]
    fn parent_sends_before_children() {
        let mut s = Scheduler::new();
        let root = s.root();
        let parent = s.open(root, Some(1), 16, false);
        let child = s.open(parent, Some(3), 16, false);
        s.activate(parent);
        s.activate(child);

        assert_eq!(s.pick_active(), Some(parent));
        s.deactivate(parent);
        assert_eq!(s.pick_active(), Some(child));
    }

    #[test]
    fn exclusive_insertion_adopts_children() {
        let mut s = Scheduler::new();
        let root = s.root();
        let a = s.open(root, Some(1), 16, false);
        let b = s.open(root, Some(3), 16, false);
        let c = s.open(root, Some(5), 16, true);

        assert_eq!(s.parent(a), Some(c));
        assert_eq!(s.parent(b), Some(c));
        assert_eq!(s.parent(c), Some(root));
    }

    #[test]
    fn close_reparents_children_to_grandparent() {
        let mut s = Scheduler::new();
        let root = s.root();
        let parent = s.open(root, Some(1), 16, false);
        let child = s.open(parent, Some(3), 16, false);
        s.activate(child);

        s.close(parent);
        assert_eq!(s.parent(child), Some(root));
        assert_eq!(s.pick_active(), Some(child));
    }

    #[test]
    fn rebind_under_own_descendant_moves_descendant_up() {
        let mut s = Scheduler::new();
        let root = s.root();
        let a = s.open(root, Some(1), 16, false);
        let b = s.open(a, Some(3), 16, false);

        s.rebind(a, b, 16, false);
        assert_eq!(s.parent(b), Some(root));
        assert_eq!(s.parent(a), Some(b));
        // No cycles: walking up from `a` terminates at the root.
        assert!(!s.is_ancestor(a, b));
    }

    #[test]
    fn find_parent_by_weight_walks_heaviest_chain() {
        let mut s = Scheduler::new();
        let root = s.root();
        let a = s.open(root, Some(1), 200, true);
        let b = s.open(a, Some(3), 100, true);
        let _c = s.open(b, Some(5), 50, true);

        assert_eq!(s.find_parent_by_weight(150), a);
        assert_eq!(s.find_parent_by_weight(100), b);
        assert_eq!(s.find_parent_by_weight(255), root);
    }

    #[test]
    fn activation_counts_survive_relocation() {
        let mut s = Scheduler::new();
        let root = s.root();
        let a = s.open(root, Some(1), 16, false);
        let b = s.open(a, Some(3), 16, false);
        s.activate(b);
        assert!(s.has_active());

        // Move the active subtree elsewhere; the root count must follow.
        let c = s.open(root, Some(5), 16, false);
        s.rebind(b, c, 16, false);
        assert!(s.has_active());
        s.deactivate(b);
        assert!(!s.has_active());
    }
}
