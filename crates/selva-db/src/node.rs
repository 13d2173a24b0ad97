//! The node record (§3): id, object, edge fields, parent/child refs, and
//! marker membership.

use std::collections::BTreeSet;

use selva_core::{NodeId, Timestamp};

use crate::edge::EdgeFieldContainer;
use crate::object::Object;

/// A record participating in the hierarchy.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    pub object: Object,
    pub edges: EdgeFieldContainer,
    parents: BTreeSet<NodeId>,
    children: BTreeSet<NodeId>,
    /// Ids of markers whose anchor traversal currently reaches this node.
    pub markers: BTreeSet<u32>,
    /// Aliases currently pointing at this node, mirrored in `object.aliases`.
    pub aliases: BTreeSet<String>,
    /// Cleared on the first explicit modify that touches this node.
    pub implicitly_created: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Node {
    pub fn new(id: NodeId, now: Timestamp) -> Self {
        Self {
            id,
            object: Object::new(),
            edges: EdgeFieldContainer::default(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            markers: BTreeSet::new(),
            aliases: BTreeSet::new(),
            implicitly_created: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parents(&self) -> impl Iterator<Item = &NodeId> {
        self.parents.iter()
    }

    pub fn children(&self) -> impl Iterator<Item = &NodeId> {
        self.children.iter()
    }

    pub fn parent_set(&self) -> &BTreeSet<NodeId> {
        &self.parents
    }

    pub fn child_set(&self) -> &BTreeSet<NodeId> {
        &self.children
    }

    pub fn is_head(&self) -> bool {
        self.parents.is_empty()
    }

    pub(crate) fn parents_mut(&mut self) -> &mut BTreeSet<NodeId> {
        &mut self.parents
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeSet<NodeId> {
        &mut self.children
    }
}
