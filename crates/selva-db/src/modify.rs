//! The `modify` operation (§4.6): a batch of triplets applied to one node
//! in order, each producing an UNCHANGED/UPDATED/REPLICATE outcome, with
//! automatic `createdAt`/`updatedAt` stamping and trigger/field-change
//! event deferral folded in.

use std::collections::BTreeSet;

use selva_core::{NodeId, Timestamp, ROOT_NODE_ID};
use snafu::OptionExt as _;

use crate::error::{DbResult, InvalidArgumentSnafu, NodeNotFoundSnafu};
use crate::hierarchy::Hierarchy;
use crate::object::{ObjectValue, SetMember, SetMode};
use crate::subscription::{self, DeferredEventQueue, EventFlags, EventKind, MarkerRegistry};
use snafu::ensure;

bitflags::bitflags! {
    /// Flags on the modify request itself (distinct from any one triplet).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModifyFlags: u8 {
        /// Reject the request outright if it targets the root node.
        const NO_ROOT = 1 << 0;
        /// Disable the usual field-level merge and replace wholesale
        /// (only meaningful to a command-dispatch layer building
        /// triplets from a whole-object payload; the triplet pipeline
        /// itself always merges field-by-field).
        const NO_MERGE = 1 << 1;
        /// Allow creating the target node if it doesn't exist.
        const CREATE = 1 << 2;
        /// Require the target node to already exist.
        const UPDATE = 1 << 3;
    }
}

/// One triplet's operation (§4.6's triplet type list).
#[derive(Debug, Clone)]
pub enum ModifyOp {
    /// Plain or default-only scalar set, distinguished by `mode`.
    Scalar { path: String, value: ObjectValue, mode: SetMode },
    /// The `$alias` triplet: a string-array of candidate aliases.
    Alias { aliases: Vec<String> },
    SetAdd { path: String, member: SetMember },
    SetRemove { path: String, member: SetMember },
    Del { path: String },
    EdgeMeta { field: String, dst: NodeId, meta_path: String, value: ObjectValue },
    IncrementLong { path: String, by: i64 },
    IncrementDouble { path: String, by: f64 },
    ArrayPush { path: String, values: Vec<ObjectValue> },
    ArrayInsert { path: String, index: usize, value: ObjectValue },
    ArrayQueueTrim { path: String, values: Vec<ObjectValue>, max_len: usize },
    ArrayRemove { path: String, index: usize },
    ObjectMetaSet { path: String, meta: u16 },
}

#[derive(Debug, Clone)]
pub struct ModifyTriplet {
    pub op: ModifyOp,
}

impl ModifyTriplet {
    pub fn new(op: ModifyOp) -> Self {
        Self { op }
    }

    fn field_path(&self) -> Option<&str> {
        match &self.op {
            ModifyOp::Scalar { path, .. }
            | ModifyOp::SetAdd { path, .. }
            | ModifyOp::SetRemove { path, .. }
            | ModifyOp::Del { path }
            | ModifyOp::IncrementLong { path, .. }
            | ModifyOp::IncrementDouble { path, .. }
            | ModifyOp::ArrayPush { path, .. }
            | ModifyOp::ArrayInsert { path, .. }
            | ModifyOp::ArrayQueueTrim { path, .. }
            | ModifyOp::ArrayRemove { path, .. }
            | ModifyOp::ObjectMetaSet { path, .. } => Some(path),
            ModifyOp::EdgeMeta { field, .. } => Some(field),
            ModifyOp::Alias { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOutcome {
    Unchanged,
    Updated,
    /// Always forwarded to replicas regardless of whether anything
    /// locally visible changed (alias reassignment).
    Replicate,
}

fn apply_one(h: &mut Hierarchy, target: NodeId, op: &ModifyOp) -> DbResult<bool> {
    let node = h.find_node_mut(target).context(NodeNotFoundSnafu { id: target })?;
    match op {
        ModifyOp::Scalar { path, value, mode } => node.object.set_scalar(path, value.clone(), *mode),
        ModifyOp::SetAdd { path, member } => node.object.add_set_member(path, member.clone()),
        ModifyOp::SetRemove { path, member } => node.object.remove_set_member(path, member),
        ModifyOp::Del { path } => Ok(node.object.del(path)),
        ModifyOp::IncrementLong { path, by } => {
            node.object.increment_long(path, *by)?;
            Ok(true)
        }
        ModifyOp::IncrementDouble { path, by } => {
            node.object.increment_double(path, *by)?;
            Ok(true)
        }
        ModifyOp::ArrayPush { path, values } => {
            node.object.insert_array(path, values.clone())?;
            Ok(true)
        }
        ModifyOp::ArrayInsert { path, index, value } => {
            node.object.insert_array_index(path, *index, value.clone())?;
            Ok(true)
        }
        ModifyOp::ArrayQueueTrim { path, values, max_len } => {
            node.object.queue_trim_array(path, values.clone(), *max_len)?;
            Ok(true)
        }
        ModifyOp::ArrayRemove { path, index } => {
            node.object.remove_array_index(path, *index)?;
            Ok(true)
        }
        ModifyOp::ObjectMetaSet { path, meta } => node.object.set_meta(path, *meta),
        ModifyOp::EdgeMeta { field, dst, meta_path, value } => {
            let Some(meta_obj) = node.edges.metadata_mut(field, dst, true)? else {
                return InvalidArgumentSnafu {
                    msg: format!("no arc from {target} to {dst} in field {field}"),
                }
                .fail();
            };
            meta_obj.set_scalar(meta_path, value.clone(), SetMode::Set)
        }
        ModifyOp::Alias { .. } => Ok(true),
    }
}

/// Runs the 3-phase modify pipeline (§4.6): resolve `$alias`, create or
/// look up the target, apply every triplet in order, stamp timestamps,
/// and defer field-change/trigger events.
pub fn modify(
    h: &mut Hierarchy,
    markers: &mut MarkerRegistry,
    events: &mut DeferredEventQueue,
    node: NodeId,
    flags: ModifyFlags,
    triplets: Vec<ModifyTriplet>,
    now: Timestamp,
) -> DbResult<Vec<ModifyOutcome>> {
    ensure!(
        node != ROOT_NODE_ID || !flags.contains(ModifyFlags::NO_ROOT),
        InvalidArgumentSnafu { msg: "modify targets the root node but NO_ROOT is set" }
    );

    let alias_aliases = triplets.iter().find_map(|t| match &t.op {
        ModifyOp::Alias { aliases } => Some(aliases.clone()),
        _ => None,
    });

    let mut target = node;
    let mut alias_resolved_existing = false;
    if let Some(aliases) = &alias_aliases {
        if let Some(existing) = aliases.iter().find_map(|a| h.resolve_alias(a)) {
            target = existing;
            alias_resolved_existing = true;
        }
    }

    let existed = h.contains(target);
    if !existed {
        ensure!(
            flags.contains(ModifyFlags::CREATE) || !flags.contains(ModifyFlags::UPDATE),
            NodeNotFoundSnafu { id: target }
        );
    }
    h.upsert(target, now);

    let is_create = {
        let n = h.find_node_mut(target).expect("just upserted");
        let was_implicit = n.implicitly_created;
        n.implicitly_created = false;
        was_implicit
    };
    if is_create {
        let n = h.find_node_mut(target).expect("just upserted");
        n.created_at = now;
        n.updated_at = now;
    }

    let mut outcomes = Vec::with_capacity(triplets.len());
    let mut touched_fields: BTreeSet<String> = BTreeSet::new();
    let mut any_field_updated = false;

    for triplet in &triplets {
        if let ModifyOp::Alias { aliases } = &triplet.op {
            if alias_resolved_existing {
                // One of the candidates already pointed at `target`:
                // nothing left to assign.
                outcomes.push(ModifyOutcome::Unchanged);
                continue;
            }
            for alias in aliases {
                h.set_alias(alias, target)?;
            }
            outcomes.push(ModifyOutcome::Replicate);
            continue;
        }

        let changed = apply_one(h, target, &triplet.op)?;
        if changed {
            if let Some(field) = triplet.field_path() {
                touched_fields.insert(field.to_string());
                any_field_updated = true;
            }
            outcomes.push(ModifyOutcome::Updated);
        } else {
            outcomes.push(ModifyOutcome::Unchanged);
        }
    }

    if !is_create && any_field_updated {
        let n = h.find_node_mut(target).expect("target exists");
        n.updated_at = now;
        touched_fields.insert("updatedAt".to_string());
    }

    // Re-settle marker membership before delivering events: an
    // expression-driven or field-filtered anchor's reachable set can
    // change as a side effect of the field writes above.
    if !touched_fields.is_empty() {
        markers.refresh_all(h)?;
    }

    for field in &touched_fields {
        subscription::defer_for_node(markers, events, h, target, EventKind::ChField, EventFlags::CH_FIELD, Some(field));
    }
    if is_create {
        subscription::defer_triggers(markers, events, h, target, subscription::TriggerKind::Created)?;
    } else if any_field_updated {
        subscription::defer_triggers(markers, events, h, target, subscription::TriggerKind::Updated)?;
    }

    let mut accessors = vec![target.to_string()];
    accessors.extend(alias_aliases.into_iter().flatten());
    for accessor in accessors {
        if let Some(sub_id) = markers.fire_missing_accessor(&accessor) {
            events.enqueue(sub_id, target, EventKind::Refresh, None);
        }
    }

    Ok(outcomes)
}

/// Builds the replication message for a completed modify batch: every
/// `UPDATED`/`REPLICATE` triplet plus synthetic triplets pinning the
/// final `createdAt`/`updatedAt`.
pub fn replication_message(
    triplets: &[ModifyTriplet],
    outcomes: &[ModifyOutcome],
    created_at: Timestamp,
    updated_at: Timestamp,
) -> Vec<ModifyOp> {
    let mut msg: Vec<ModifyOp> = triplets
        .iter()
        .zip(outcomes)
        .filter(|(_, o)| !matches!(o, ModifyOutcome::Unchanged))
        .map(|(t, _)| t.op.clone())
        .collect();
    msg.push(ModifyOp::IncrementLong { path: "createdAt".to_string(), by: created_at.0 });
    msg.push(ModifyOp::IncrementLong { path: "updatedAt".to_string(), by: updated_at.0 });
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{AnchorDescriptor, EventFlags as EF, MarkerOwner, SubscriptionMarker};
    use crate::traversal::Direction;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn create_sets_timestamps_and_fires_created_trigger() {
        let mut h = Hierarchy::new();
        let mut markers = MarkerRegistry::new();
        let mut events = DeferredEventQueue::new();

        let sub_id = subscription::subscription_id_from_seed(b"created");
        markers
            .add_marker(
                &mut h,
                SubscriptionMarker {
                    id: 1,
                    sub_id,
                    flags: EF::TRIGGER,
                    anchor_node: selva_core::ROOT_NODE_ID,
                    anchor: AnchorDescriptor::Direction(Direction::BFS_DESCENDANTS),
                    field_filter: Default::default(),
                    filter_expr: None,
                    owner: MarkerOwner::Subscriber,
                    trigger: Some(subscription::TriggerKind::Created),
                    detached: false,
                },
            )
            .unwrap();

        let triplets = vec![ModifyTriplet::new(ModifyOp::Scalar {
            path: "title".to_string(),
            value: ObjectValue::String("hello".to_string()),
            mode: SetMode::Set,
        })];
        let outcomes = modify(&mut h, &mut markers, &mut events, id("ma1"), ModifyFlags::CREATE, triplets, Timestamp(100)).unwrap();
        assert_eq!(outcomes, vec![ModifyOutcome::Updated]);

        let n = h.find_node(id("ma1")).unwrap();
        assert_eq!(n.created_at, Timestamp(100));
        assert_eq!(n.updated_at, Timestamp(100));

        let flushed = events.flush();
        assert!(flushed.iter().any(|e| matches!(e.kind, EventKind::Trigger(subscription::TriggerKind::Created))));
    }

    #[test]
    fn pure_update_advances_updated_at_and_defers_field_change() {
        let mut h = Hierarchy::new();
        let mut markers = MarkerRegistry::new();
        let mut events = DeferredEventQueue::new();
        modify(
            &mut h,
            &mut markers,
            &mut events,
            id("ma1"),
            ModifyFlags::CREATE,
            vec![ModifyTriplet::new(ModifyOp::Scalar {
                path: "title".to_string(),
                value: ObjectValue::String("a".to_string()),
                mode: SetMode::Set,
            })],
            Timestamp(1),
        )
        .unwrap();
        events.flush();

        modify(
            &mut h,
            &mut markers,
            &mut events,
            id("ma1"),
            ModifyFlags::empty(),
            vec![ModifyTriplet::new(ModifyOp::Scalar {
                path: "title".to_string(),
                value: ObjectValue::String("b".to_string()),
                mode: SetMode::Set,
            })],
            Timestamp(2),
        )
        .unwrap();

        let n = h.find_node(id("ma1")).unwrap();
        assert_eq!(n.updated_at, Timestamp(2));
        assert_eq!(n.created_at, Timestamp(1));
    }

    #[test]
    fn unchanged_scalar_write_produces_no_field_event() {
        let mut h = Hierarchy::new();
        let mut markers = MarkerRegistry::new();
        let mut events = DeferredEventQueue::new();
        let triplet = || {
            ModifyTriplet::new(ModifyOp::Scalar {
                path: "title".to_string(),
                value: ObjectValue::String("a".to_string()),
                mode: SetMode::Set,
            })
        };
        modify(&mut h, &mut markers, &mut events, id("ma1"), ModifyFlags::CREATE, vec![triplet()], Timestamp(1)).unwrap();
        events.flush();

        let outcomes = modify(&mut h, &mut markers, &mut events, id("ma1"), ModifyFlags::empty(), vec![triplet()], Timestamp(2)).unwrap();
        assert_eq!(outcomes, vec![ModifyOutcome::Unchanged]);
        assert_eq!(h.find_node(id("ma1")).unwrap().updated_at, Timestamp(1));
    }
}
