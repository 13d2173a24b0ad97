//! Marker-based change detection: placement, refresh, deferred/deduplicated
//! events, triggers, and missing-accessor markers (§4.4).

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use selva_core::NodeId;
use selva_rpn::Expr;
use snafu::OptionExt as _;

use crate::error::{DbResult, SubscriptionAlreadyExistsSnafu, SubscriptionNotFoundSnafu};
use crate::hierarchy::Hierarchy;
use crate::traversal::{self, Direction, HierarchyEvalContext, TraversalVisitor};

/// A 32-byte subscription id (sha256-shaped opaque bytes, per §3 — we use
/// blake3 since the source hash algorithm itself is out of scope).
pub type SubId = [u8; 32];

pub fn subscription_id_from_seed(seed: &[u8]) -> SubId {
    *blake3::hash(seed).as_bytes()
}

bitflags::bitflags! {
    /// Event flags a marker listens for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u8 {
        const CH_HIERARCHY = 1 << 0;
        const CH_FIELD     = 1 << 1;
        const REFRESH      = 1 << 2;
        const CL_HIERARCHY = 1 << 3;
        const TRIGGER      = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerKind {
    Created,
    Updated,
    Deleted,
}

/// What a marker notifies when it fires: either a subscriber waiting on a
/// deferred event, or the auto-indexing engine maintaining an ICB's cached
/// result incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOwner {
    Subscriber,
    Indexer(u64),
}

/// The traversal an anchor marker refreshes over: either a hierarchy
/// pseudo-direction, a named edge field, or an expression.
#[derive(Debug, Clone)]
pub enum AnchorDescriptor {
    Direction(Direction),
    EdgeField(String),
    Expression { field_expr: Expr, edge_filter: Option<Expr> },
}

#[derive(Debug, Clone)]
pub struct SubscriptionMarker {
    pub id: u32,
    pub sub_id: SubId,
    pub flags: EventFlags,
    pub anchor_node: NodeId,
    pub anchor: AnchorDescriptor,
    /// Empty means "all fields".
    pub field_filter: BTreeSet<String>,
    pub filter_expr: Option<Expr>,
    pub owner: MarkerOwner,
    pub trigger: Option<TriggerKind>,
    /// "Whole hierarchy" / "all new nodes" scope: stored on the hierarchy
    /// rather than any one node's membership set.
    pub detached: bool,
}

impl SubscriptionMarker {
    fn matches(&self, h: &Hierarchy, node: NodeId) -> DbResult<bool> {
        let ctx = HierarchyEvalContext { hierarchy: h, current: node };
        Ok(selva_rpn::eval_bool(self.filter_expr.as_ref(), &ctx)?)
    }
}

/// The set of markers on a node, plus the hierarchy-wide registry of all
/// markers. Marker ids are globally unique (a node's membership set is a
/// flat `BTreeSet<u32>` with no subscription tag), matching the "cyclic
/// ownership" design note: membership sets store ids, the registry owns
/// the records.
#[derive(Debug, Default)]
pub struct MarkerRegistry {
    markers: BTreeMap<u32, SubscriptionMarker>,
    by_subscription: BTreeMap<SubId, BTreeSet<u32>>,
    detached: BTreeSet<u32>,
    /// One-shot markers on an accessor (id or alias string) that doesn't
    /// currently resolve to a node.
    missing_accessor: BTreeMap<String, SubId>,
    next_marker_id: u32,
    next_icb_id: u64,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_marker_id(&mut self) -> u32 {
        self.next_marker_id += 1;
        self.next_marker_id
    }

    pub fn next_icb_id(&mut self) -> u64 {
        self.next_icb_id += 1;
        self.next_icb_id
    }

    pub fn get(&self, marker_id: u32) -> Option<&SubscriptionMarker> {
        self.markers.get(&marker_id)
    }

    pub fn markers_of(&self, sub_id: SubId) -> impl Iterator<Item = &SubscriptionMarker> {
        self.by_subscription
            .get(&sub_id)
            .into_iter()
            .flat_map(move |ids| ids.iter().filter_map(move |id| self.markers.get(id)))
    }

    pub fn exists(&self, sub_id: SubId) -> bool {
        self.by_subscription.contains_key(&sub_id)
    }

    /// Registers a new marker and refreshes it immediately.
    pub fn add_marker(&mut self, h: &mut Hierarchy, marker: SubscriptionMarker) -> DbResult<()> {
        let id = marker.id;
        if self.markers.contains_key(&id) {
            return SubscriptionAlreadyExistsSnafu { id: format_sub_id(&marker.sub_id) }.fail();
        }
        self.by_subscription.entry(marker.sub_id).or_default().insert(id);
        if marker.detached {
            self.detached.insert(id);
        }
        self.markers.insert(id, marker);
        self.refresh(h, id)?;
        Ok(())
    }

    /// The refresh contract (§4.4): bump the transaction counter, traverse
    /// from the anchor, and for every node that matches the filter, add the
    /// marker to its membership set and fire `REFRESH`.
    pub fn refresh(&mut self, h: &mut Hierarchy, marker_id: u32) -> DbResult<()> {
        let Some(marker) = self.markers.get(&marker_id).cloned() else {
            return SubscriptionNotFoundSnafu { id: marker_id.to_string() }.fail();
        };
        if marker.detached {
            return Ok(());
        }

        let mut collector = MembershipCollector::default();
        match &marker.anchor {
            AnchorDescriptor::Direction(dir) => {
                if dir.contains(Direction::BFS_ANCESTORS) {
                    traversal::bfs(h, marker.anchor_node, true, &mut collector)?;
                } else if dir.contains(Direction::BFS_DESCENDANTS) {
                    traversal::bfs(h, marker.anchor_node, false, &mut collector)?;
                } else if dir.contains(Direction::DFS_ANCESTORS) {
                    traversal::dfs(h, marker.anchor_node, true, &mut collector)?;
                } else {
                    traversal::dfs(h, marker.anchor_node, false, &mut collector)?;
                }
            }
            AnchorDescriptor::EdgeField(field) => {
                traversal::bfs_edge_field(h, marker.anchor_node, field, &mut collector)?;
            }
            AnchorDescriptor::Expression { field_expr, edge_filter } => {
                traversal::expression_traversal(h, marker.anchor_node, field_expr, edge_filter.as_ref(), &mut collector)?;
            }
        }

        let mut matched = BTreeSet::new();
        for node in collector.matched {
            if marker.matches(h, node)? {
                matched.insert(node);
            }
        }
        for node in h.node_ids_snapshot() {
            let Some(n) = h.find_node_mut(node) else { continue };
            if matched.contains(&node) {
                n.markers.insert(marker.id);
            } else {
                n.markers.remove(&marker.id);
            }
        }
        Ok(())
    }

    /// Re-evaluates membership for every non-detached marker. A coarser,
    /// less surgical update than true incremental diffing against the
    /// mutated node set, but correct: refresh fully resyncs a marker's
    /// membership and is idempotent.
    pub fn refresh_all(&mut self, h: &mut Hierarchy) -> DbResult<()> {
        let ids: Vec<u32> = self.markers.keys().copied().collect();
        for id in ids {
            self.refresh(h, id)?;
        }
        Ok(())
    }

    /// Removes every marker in `sub_id` from every node's membership set and
    /// from the detached list, then drops the subscription record.
    pub fn delete_subscription(&mut self, h: &mut Hierarchy, sub_id: SubId) -> DbResult<()> {
        let ids = self
            .by_subscription
            .remove(&sub_id)
            .context(SubscriptionNotFoundSnafu { id: format_sub_id(&sub_id) })?;
        for id in &ids {
            self.markers.remove(id);
            self.detached.remove(id);
        }
        for node in h.node_ids_snapshot() {
            if let Some(n) = h.find_node_mut(node) {
                n.markers.retain(|id| !ids.contains(id));
            }
        }
        self.missing_accessor.retain(|_, s| *s != sub_id);
        Ok(())
    }

    // -- Missing-accessor markers --

    pub fn register_missing_accessor(&mut self, accessor: impl Into<String>, sub_id: SubId) {
        self.missing_accessor.insert(accessor.into(), sub_id);
    }

    /// Checks whether `accessor` (an id or alias string that just started
    /// resolving) has a one-shot marker; fires and removes it if so.
    pub fn fire_missing_accessor(&mut self, accessor: &str) -> Option<SubId> {
        self.missing_accessor.remove(accessor)
    }

    pub(crate) fn trigger_markers(&self) -> impl Iterator<Item = &SubscriptionMarker> {
        self.markers.values().filter(|m| m.trigger.is_some())
    }

    pub(crate) fn markers_on_node<'a>(&'a self, h: &'a Hierarchy, node: NodeId) -> Vec<&'a SubscriptionMarker> {
        let Some(n) = h.find_node(node) else { return Vec::new() };
        n.markers.iter().filter_map(|id| self.markers.get(id)).collect()
    }
}

fn format_sub_id(sub_id: &SubId) -> String {
    base64::engine::general_purpose::STANDARD.encode(sub_id)
}

#[derive(Default)]
struct MembershipCollector {
    matched: Vec<NodeId>,
}

impl TraversalVisitor for MembershipCollector {
    fn node(&mut self, node: NodeId) -> bool {
        self.matched.push(node);
        false
    }

    fn head(&mut self, node: NodeId) {
        // Anchor membership includes the head for CH_HIERARCHY/CH_FIELD
        // delivery even though traversal result-sets usually skip it.
        self.matched.push(node);
    }
}

/// An event kind as delivered to a subscriber; trigger events carry their
/// kind so (subscription, node, event-kind) stays the one dedup key (P9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    ChHierarchy,
    ClHierarchy,
    ChField,
    Refresh,
    Trigger(TriggerKind),
}

#[derive(Debug, Clone)]
pub struct DeferredEvent {
    pub sub_id: SubId,
    pub node: NodeId,
    pub kind: EventKind,
    pub fields: BTreeSet<String>,
}

/// Events enqueued during a mutation batch, deduplicated by
/// `(subscription, node, event-kind)` (P9) and flushed at the end of the
/// batch.
#[derive(Debug, Default)]
pub struct DeferredEventQueue {
    pending: BTreeMap<(SubId, NodeId, EventKind), BTreeSet<String>>,
}

impl DeferredEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, sub_id: SubId, node: NodeId, kind: EventKind, field: Option<&str>) {
        let entry = self.pending.entry((sub_id, node, kind)).or_default();
        if let Some(field) = field {
            entry.insert(field.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the queue, delivering events once per `(subscription, node,
    /// kind)` tuple.
    pub fn flush(&mut self) -> Vec<DeferredEvent> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|((sub_id, node, kind), fields)| DeferredEvent { sub_id, node, kind, fields })
            .collect()
    }
}

/// For every marker on `node` with a matching `flags` bit, enqueues a
/// deferred event. `field` narrows delivery to markers whose field-filter
/// is empty or contains it (only meaningful for `CH_FIELD`).
pub fn defer_for_node(
    registry: &MarkerRegistry,
    queue: &mut DeferredEventQueue,
    h: &Hierarchy,
    node: NodeId,
    kind: EventKind,
    flag: EventFlags,
    field: Option<&str>,
) {
    for marker in registry.markers_on_node(h, node) {
        if !marker.flags.contains(flag) {
            continue;
        }
        if let Some(field) = field {
            if !marker.field_filter.is_empty() && !marker.field_filter.contains(field) {
                continue;
            }
        }
        queue.enqueue(marker.sub_id, node, kind, field);
    }
}

/// Fires trigger markers matching `kind` against `node` (CREATED/UPDATED
/// fire once per node per batch via the same dedup key as other events).
pub fn defer_triggers(
    registry: &MarkerRegistry,
    queue: &mut DeferredEventQueue,
    h: &Hierarchy,
    node: NodeId,
    kind: TriggerKind,
) -> DbResult<()> {
    for marker in registry.trigger_markers() {
        if marker.trigger != Some(kind) {
            continue;
        }
        if marker.matches(h, node)? {
            queue.enqueue(marker.sub_id, node, EventKind::Trigger(kind), None);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use selva_core::Timestamp;
    use selva_rpn::compile;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn refresh_places_marker_on_matching_descendants() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("ma1"), &[id("root")], &[], Timestamp::ZERO).unwrap();
        h.upsert(id("ma1"), Timestamp::ZERO).object.set_string("type", "ma", crate::object::SetMode::Set).unwrap();

        let mut registry = MarkerRegistry::new();
        let sub_id = subscription_id_from_seed(b"sub-s5");
        let marker = SubscriptionMarker {
            id: 1,
            sub_id,
            flags: EventFlags::CH_FIELD,
            anchor_node: selva_core::ROOT_NODE_ID,
            anchor: AnchorDescriptor::Direction(Direction::BFS_DESCENDANTS),
            field_filter: BTreeSet::new(),
            filter_expr: Some(compile(r#"type == "ma""#).unwrap()),
            owner: MarkerOwner::Subscriber,
            trigger: None,
            detached: false,
        };
        registry.add_marker(&mut h, marker).unwrap();

        let node = h.find_node(id("ma1")).unwrap();
        assert!(node.markers.contains(&1));
    }

    #[test]
    fn deferred_events_dedup_by_subscription_node_kind() {
        let mut queue = DeferredEventQueue::new();
        let sub = subscription_id_from_seed(b"s");
        queue.enqueue(sub, id("ma1"), EventKind::ChField, Some("title"));
        queue.enqueue(sub, id("ma1"), EventKind::ChField, Some("body"));
        let events = queue.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fields, ["title".to_string(), "body".to_string()].into_iter().collect());
    }

    #[test]
    fn delete_subscription_clears_membership() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("ma1"), &[id("root")], &[], Timestamp::ZERO).unwrap();
        let mut registry = MarkerRegistry::new();
        let sub_id = subscription_id_from_seed(b"sub-del");
        let marker = SubscriptionMarker {
            id: 7,
            sub_id,
            flags: EventFlags::CH_HIERARCHY,
            anchor_node: selva_core::ROOT_NODE_ID,
            anchor: AnchorDescriptor::Direction(Direction::BFS_DESCENDANTS),
            field_filter: BTreeSet::new(),
            filter_expr: None,
            owner: MarkerOwner::Subscriber,
            trigger: None,
            detached: false,
        };
        registry.add_marker(&mut h, marker).unwrap();
        assert!(h.find_node(id("ma1")).unwrap().markers.contains(&7));
        registry.delete_subscription(&mut h, sub_id).unwrap();
        assert!(h.find_node(id("ma1")).unwrap().markers.is_empty());
        assert!(!registry.exists(sub_id));
    }
}
