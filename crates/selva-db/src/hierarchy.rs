//! The node index, parent/child multigraph, alias map, and edge fields
//! (§4.1). This module owns invariants P1-P4; traversal, subscriptions, and
//! indexing build on top of it rather than living inside it.

use std::collections::{BTreeMap, BTreeSet};

use selva_core::{NodeId, Timestamp, ROOT_NODE_ID};
use snafu::OptionExt as _;

use crate::edge::{ConstraintFlags, EdgeFieldConstraint};
use crate::error::{DbResult, NameTooLongSnafu, NodeNotFoundSnafu};
use crate::node::Node;

bitflags::bitflags! {
    /// Flags accepted by [`Hierarchy::delete_node`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteFlags: u8 {
        const FORCE = 0b001;
        const DETACH = 0b010;
        const REPLY_IDS = 0b100;
    }
}

/// The node index, heads set, edge-constraint registry, and alias map.
///
/// Subscription and auto-indexing state live alongside this in the
/// top-level `Db` aggregate (see `lib.rs`); this type only owns what §4.1
/// describes as the hierarchy store proper.
#[derive(Debug)]
pub struct Hierarchy {
    nodes: BTreeMap<NodeId, Node>,
    heads: BTreeSet<NodeId>,
    constraints: BTreeMap<String, EdgeFieldConstraint>,
    aliases: BTreeMap<String, NodeId>,
    types: BTreeMap<[u8; selva_core::NODE_TYPE_CODE_LEN], String>,
    /// Monotonic counter bumped at the start of every traversal (§3).
    tx_counter: u64,
    visit_stamps: BTreeMap<NodeId, u64>,
    /// Detached (compressed) subtrees, keyed by the id of their former root.
    /// Byte layout is out of scope (§1); we keep only the node set needed to
    /// restore referential integrity on `DETACH`/restore.
    detached: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Default for Hierarchy {
    fn default() -> Self {
        let mut h = Self {
            nodes: BTreeMap::new(),
            heads: BTreeSet::new(),
            constraints: BTreeMap::new(),
            aliases: BTreeMap::new(),
            types: BTreeMap::new(),
            tx_counter: 0,
            visit_stamps: BTreeMap::new(),
            detached: BTreeMap::new(),
        };
        h.nodes.insert(ROOT_NODE_ID, Node::new(ROOT_NODE_ID, Timestamp::ZERO));
        h.heads.insert(ROOT_NODE_ID);
        h
    }
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Transaction stamping (§3) --

    /// Starts a new traversal, returning its stamp.
    pub(crate) fn begin_traversal(&mut self) -> u64 {
        self.tx_counter += 1;
        self.tx_counter
    }

    pub(crate) fn stamp_visited(&mut self, id: NodeId, stamp: u64) -> bool {
        let prev = self.visit_stamps.insert(id, stamp);
        prev != Some(stamp)
    }

    // -- Lookup --

    pub fn find_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn find_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn heads(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.heads.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids_snapshot(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<NodeId> {
        self.aliases.get(alias).copied()
    }

    pub fn constraint(&self, id: &str) -> Option<&EdgeFieldConstraint> {
        self.constraints.get(id)
    }

    pub fn register_constraint(&mut self, constraint: EdgeFieldConstraint) {
        self.constraints.insert(constraint.id.clone(), constraint);
    }

    pub fn register_simple_constraint(&mut self, id: impl Into<String>, flags: ConstraintFlags) {
        self.register_constraint(EdgeFieldConstraint::new(id, flags));
    }

    // -- Types map (hierarchy.types.add/clear/list) --

    pub fn types_add(&mut self, code: [u8; selva_core::NODE_TYPE_CODE_LEN], display_name: impl Into<String>) {
        self.types.insert(code, display_name.into());
    }

    pub fn types_clear(&mut self) {
        self.types.clear();
    }

    pub fn types_list(&self) -> impl Iterator<Item = (&[u8; selva_core::NODE_TYPE_CODE_LEN], &str)> {
        self.types.iter().map(|(k, v)| (k, v.as_str()))
    }

    // -- Node lifecycle --

    /// Returns the existing node or creates one, installing it in the index
    /// and the head-set.
    pub fn upsert(&mut self, id: NodeId, now: Timestamp) -> &mut Node {
        if !self.nodes.contains_key(&id) {
            self.nodes.insert(id, Node::new(id, now));
            self.heads.insert(id);
        }
        self.nodes.get_mut(&id).expect("just inserted")
    }

    fn recompute_head(&mut self, id: NodeId) {
        let is_head = self.nodes.get(&id).is_some_and(Node::is_head);
        if is_head {
            self.heads.insert(id);
        } else {
            self.heads.remove(&id);
        }
    }

    /// Destructively replaces both parent and child sets of `id` to exactly
    /// the listed ones (P7). Missing referenced nodes are created.
    pub fn set_hierarchy(
        &mut self,
        id: NodeId,
        parents: &[NodeId],
        children: &[NodeId],
        now: Timestamp,
    ) -> DbResult<()> {
        self.upsert(id, now);

        let old_parents: Vec<NodeId> = self.nodes[&id].parents().copied().collect();
        let old_children: Vec<NodeId> = self.nodes[&id].children().copied().collect();

        for p in &old_parents {
            if !parents.contains(p) {
                self.unlink(*p, id);
            }
        }
        for c in &old_children {
            if !children.contains(c) {
                self.unlink(id, *c);
            }
        }
        for p in parents {
            self.upsert(*p, now);
            self.link(*p, id);
        }
        for c in children {
            self.upsert(*c, now);
            self.link(id, *c);
        }

        self.recompute_head(id);
        for p in old_parents.iter().chain(parents.iter()) {
            self.recompute_head(*p);
        }
        for c in old_children.iter().chain(children.iter()) {
            self.recompute_head(*c);
        }
        Ok(())
    }

    /// Union variant: adds parents/children without touching existing ones.
    pub fn add_hierarchy(
        &mut self,
        id: NodeId,
        parents: &[NodeId],
        children: &[NodeId],
        now: Timestamp,
    ) -> DbResult<()> {
        self.upsert(id, now);
        for p in parents {
            self.upsert(*p, now);
            self.link(*p, id);
        }
        for c in children {
            self.upsert(*c, now);
            self.link(id, *c);
        }
        self.recompute_head(id);
        for p in parents {
            self.recompute_head(*p);
        }
        for c in children {
            self.recompute_head(*c);
        }
        Ok(())
    }

    /// Subtract variant: removes the listed parents/children, leaving
    /// others untouched.
    pub fn del_hierarchy(&mut self, id: NodeId, parents: &[NodeId], children: &[NodeId]) -> DbResult<()> {
        if !self.contains(id) {
            return NodeNotFoundSnafu { id }.fail();
        }
        for p in parents {
            self.unlink(*p, id);
        }
        for c in children {
            self.unlink(id, *c);
        }
        self.recompute_head(id);
        for p in parents {
            self.recompute_head(*p);
        }
        for c in children {
            self.recompute_head(*c);
        }
        Ok(())
    }

    fn link(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children_mut().insert(child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parents_mut().insert(parent);
        }
    }

    fn unlink(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children_mut().remove(&child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parents_mut().remove(&parent);
        }
    }

    /// Removes `id` from the index, purging every reference to it: parent
    /// and child links, edge-field arcs, aliases, and (via the returned
    /// list) any further nodes that cascade.
    pub fn delete_node(&mut self, id: NodeId, flags: DeleteFlags) -> DbResult<Vec<NodeId>> {
        if id == ROOT_NODE_ID {
            return crate::error::InvalidArgumentSnafu { msg: "the root node cannot be deleted" }
                .fail();
        }
        let Some(node) = self.nodes.get(&id) else {
            return NodeNotFoundSnafu { id }.fail();
        };
        let parents: Vec<NodeId> = node.parents().copied().collect();
        let children: Vec<NodeId> = node.children().copied().collect();
        let aliases: Vec<String> = node.aliases.iter().cloned().collect();

        let mut deleted = vec![id];

        for p in &parents {
            self.unlink(*p, id);
        }
        for c in &children {
            self.unlink(id, *c);
        }
        for alias in aliases {
            self.aliases.remove(&alias);
        }
        for other in self.nodes.values_mut() {
            other.edges.remove_all_arcs_to(&id);
        }
        self.nodes.remove(&id);
        self.heads.remove(&id);
        self.visit_stamps.remove(&id);

        if flags.contains(DeleteFlags::FORCE) {
            for c in children {
                let now_orphan = self.nodes.get(&c).is_some_and(Node::is_head);
                if now_orphan {
                    let cascaded = self.delete_node(c, flags)?;
                    deleted.extend(cascaded);
                } else {
                    self.recompute_head(c);
                }
            }
        } else {
            for c in children {
                self.recompute_head(c);
            }
        }
        for p in parents {
            self.recompute_head(p);
        }

        if flags.contains(DeleteFlags::DETACH) {
            self.detached.insert(id, deleted.iter().copied().collect());
        }

        Ok(deleted)
    }

    // -- Aliases --

    pub fn set_alias(&mut self, alias: &str, id: NodeId) -> DbResult<()> {
        if alias.len() > 256 {
            return NameTooLongSnafu {}.fail();
        }
        if let Some(prev) = self.aliases.insert(alias.to_string(), id) {
            if let Some(node) = self.nodes.get_mut(&prev) {
                node.aliases.remove(alias);
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.aliases.insert(alias.to_string());
        }
        Ok(())
    }

    pub fn remove_alias(&mut self, alias: &str) -> Option<NodeId> {
        let id = self.aliases.remove(alias)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.aliases.remove(alias);
        }
        Some(id)
    }

    // -- Edge fields --

    pub fn add_edge(&mut self, constraint_id: &str, field: &str, src: NodeId, dst: NodeId, now: Timestamp) -> DbResult<()> {
        let constraint = self
            .constraint(constraint_id)
            .cloned()
            .unwrap_or_else(|| EdgeFieldConstraint::new(constraint_id, ConstraintFlags::default()));
        self.upsert(src, now);
        self.upsert(dst, now);
        let src_type = src.type_code();

        let src_node = self.nodes.get_mut(&src).expect("just upserted");
        src_node.edges.add_arc(field, &constraint, src, src_type, dst)?;

        if constraint.flags.bidirectional {
            if let Some(inverse_field) = &constraint.inverse_field {
                let dst_type = dst.type_code();
                let dst_node = self.nodes.get_mut(&dst).expect("just upserted");
                let _ = dst_node.edges.add_arc(inverse_field, &constraint, dst, dst_type, src);
            }
        }
        Ok(())
    }

    pub fn delete_edge(&mut self, field: &str, src: NodeId, dst: NodeId) -> DbResult<()> {
        let constraint_id = {
            let src_node = self.find_node(src).context(NodeNotFoundSnafu { id: src })?;
            src_node.edges.get(field).map(|f| f.constraint.clone())
        };
        if let Some(src_node) = self.nodes.get_mut(&src) {
            src_node.edges.remove_arc(field, &dst);
        }
        if let Some(constraint_id) = constraint_id {
            if let Some(constraint) = self.constraint(&constraint_id).cloned() {
                if constraint.flags.bidirectional {
                    if let Some(inverse_field) = &constraint.inverse_field {
                        if let Some(dst_node) = self.nodes.get_mut(&dst) {
                            dst_node.edges.remove_arc(inverse_field, &src);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn clear_field(&mut self, node: NodeId, field: &str) -> DbResult<Vec<NodeId>> {
        let removed = {
            let n = self.find_node_mut(node).context(NodeNotFoundSnafu { id: node })?;
            n.edges.clear_field(field)
        };
        for dst in &removed {
            if let Some(dst_node) = self.nodes.get_mut(dst) {
                // Best-effort inverse cleanup: remove any arc back to `node`
                // on every field (the specific inverse field name may not be
                // known if the constraint was since dropped).
                dst_node.edges.remove_all_arcs_to(&node);
            }
        }
        Ok(removed)
    }

    // -- Invariant checks (used by tests / debug assertions) --

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (id, node) in &self.nodes {
            for p in node.parents() {
                let parent = self.nodes.get(p).expect("parent exists");
                assert!(parent.child_set().contains(id), "P1 violated: {id} not in children({p})");
            }
            for c in node.children() {
                let child = self.nodes.get(c).expect("P3: child exists");
                assert!(child.parent_set().contains(id), "P1 violated: {id} not in parents({c})");
            }
        }
        for (id, node) in &self.nodes {
            let should_be_head = node.parent_set().is_empty();
            assert_eq!(self.heads.contains(id), should_be_head, "P2 violated for {id}");
        }
        for (alias, id) in &self.aliases {
            let node = self.nodes.get(id).expect("aliased node exists");
            assert!(node.aliases.contains(alias), "P3 violated for alias {alias}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traversal::{reachable, Direction};

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn s1_parents_children_round_trip() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("c"), &[id("a"), id("b")], &[], Timestamp::ZERO).unwrap();
        h.set_hierarchy(id("d"), &[id("b")], &[], Timestamp::ZERO).unwrap();

        assert_eq!(reachable(&mut h, id("d"), Direction::BFS_ANCESTORS).unwrap(), [id("b")].into());
        assert_eq!(
            reachable(&mut h, id("c"), Direction::BFS_ANCESTORS).unwrap(),
            [id("a"), id("b")].into()
        );
        assert_eq!(reachable(&mut h, id("a"), Direction::BFS_DESCENDANTS).unwrap(), [id("c")].into());
        assert_eq!(
            reachable(&mut h, id("b"), Direction::BFS_DESCENDANTS).unwrap(),
            [id("c"), id("d")].into()
        );
        let heads: BTreeSet<_> = h.heads().collect();
        assert!(heads.contains(&id("a")));
        assert!(heads.contains(&id("b")));
        assert!(heads.contains(&ROOT_NODE_ID));
        h.check_invariants();
    }

    #[test]
    fn s2_alter_and_retest() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("c"), &[id("a"), id("b")], &[], Timestamp::ZERO).unwrap();
        h.set_hierarchy(id("d"), &[id("b")], &[], Timestamp::ZERO).unwrap();

        h.add_hierarchy(id("b"), &[id("e")], &[], Timestamp::ZERO).unwrap();

        let heads: BTreeSet<_> = h.heads().collect();
        assert!(heads.contains(&id("e")));
        assert!(heads.contains(&id("a")));
        assert!(!heads.contains(&id("b")));
        assert_eq!(
            reachable(&mut h, id("c"), Direction::BFS_ANCESTORS).unwrap(),
            [id("a"), id("b"), id("e")].into()
        );
        h.check_invariants();
    }

    #[test]
    fn s3_cascading_delete() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("c"), &[id("a"), id("b")], &[], Timestamp::ZERO).unwrap();
        h.set_hierarchy(id("d"), &[id("b")], &[], Timestamp::ZERO).unwrap();
        h.add_hierarchy(id("b"), &[id("e")], &[], Timestamp::ZERO).unwrap();
        h.set_alias("lead", id("a")).unwrap();

        h.delete_node(id("b"), DeleteFlags::FORCE).unwrap();

        assert!(!h.contains(id("b")));
        assert!(!h.find_node(id("c")).unwrap().parents().any(|p| *p == id("b")));
        let heads: BTreeSet<_> = h.heads().collect();
        assert!(heads.contains(&id("d")));
        assert_eq!(reachable(&mut h, id("e"), Direction::BFS_DESCENDANTS).unwrap(), [id("c")].into());
        assert_eq!(h.resolve_alias("lead"), Some(id("a")));
        h.check_invariants();
    }

    mod proptest_hierarchy {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// P1/P2/P6: random sequences of set/add/del-hierarchy calls never
            /// break bidirectional parent/child consistency or the head-set
            /// definition, and a descendants traversal never revisits a node.
            #[test]
            fn random_mutations_preserve_p1_p2(ops in prop::collection::vec(0u8..4, 1..40)) {
                let mut h = Hierarchy::new();
                let pool: Vec<NodeId> = (0..6).map(|i| id(&format!("n{i}"))).collect();
                for (i, op) in ops.iter().enumerate() {
                    let target = pool[i % pool.len()];
                    let other = pool[(i + 1) % pool.len()];
                    match op {
                        0 => { let _ = h.set_hierarchy(target, &[other], &[], Timestamp::ZERO); }
                        1 => { let _ = h.add_hierarchy(target, &[other], &[], Timestamp::ZERO); }
                        2 => { let _ = h.del_hierarchy(target, &[other], &[]); }
                        _ => { let _ = h.delete_node(target, DeleteFlags::empty()); }
                    }
                    h.check_invariants();
                }
                for node in h.node_ids_snapshot() {
                    let visited = reachable(&mut h, node, Direction::BFS_DESCENDANTS).unwrap();
                    prop_assert!(visited.len() <= h.len());
                }
            }
        }
    }
}
