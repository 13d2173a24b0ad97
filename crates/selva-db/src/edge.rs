//! Typed named arcs with per-constraint semantics (§3, §4.1 "Edge fields").

use std::collections::BTreeSet;

use selva_core::NodeId;

use crate::error::{DbResult, EdgeAlreadyExistsSnafu, EdgeConstraintViolationSnafu};
use crate::object::Object;

/// Behavioural flags for an [`EdgeFieldConstraint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstraintFlags {
    pub single_ref: bool,
    pub bidirectional: bool,
    pub dynamic: bool,
}

/// Describes how an edge field named by a constraint id behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeFieldConstraint {
    pub id: String,
    pub flags: ConstraintFlags,
    /// Expected type code of the source node, or `None` if unconstrained.
    pub src_type: Option<[u8; selva_core::NODE_TYPE_CODE_LEN]>,
    /// Name of the inverse field on the destination, for bidirectional fields.
    pub inverse_field: Option<String>,
}

impl EdgeFieldConstraint {
    pub fn new(id: impl Into<String>, flags: ConstraintFlags) -> Self {
        Self { id: id.into(), flags, src_type: None, inverse_field: None }
    }
}

/// One named outgoing-arc bundle on a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeField {
    arcs: BTreeSet<NodeId>,
    /// Per-destination metadata, lazily created.
    meta: Option<Object>,
    pub constraint: String,
}

impl EdgeField {
    fn new(constraint: impl Into<String>) -> Self {
        Self { arcs: BTreeSet::new(), meta: None, constraint: constraint.into() }
    }

    pub fn arcs(&self) -> impl Iterator<Item = &NodeId> {
        self.arcs.iter()
    }

    pub fn contains(&self, dst: &NodeId) -> bool {
        self.arcs.contains(dst)
    }

    pub fn len(&self) -> usize {
        self.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }

    fn metadata_key(dst: &NodeId) -> String {
        dst.to_string()
    }

    pub fn metadata(&self, dst: &NodeId) -> Option<&Object> {
        self.meta.as_ref().and_then(|m| match m.get(&Self::metadata_key(dst)) {
            Some(crate::object::ObjectValue::Object(o)) => Some(o),
            _ => None,
        })
    }

    /// Lazily creates the metadata object for `(field, dst)` when `create`
    /// is set and the arc exists.
    pub fn metadata_mut(&mut self, dst: &NodeId, create: bool) -> DbResult<Option<&mut Object>> {
        if !self.arcs.contains(dst) {
            return Ok(None);
        }
        if !create && self.meta.is_none() {
            return Ok(None);
        }
        let meta = self.meta.get_or_insert_with(Object::new);
        let key = Self::metadata_key(dst);
        if !create && meta.get(&key).is_none() {
            return Ok(None);
        }
        Ok(Some(meta.ensure_object_mut(&key)?))
    }

    fn remove_meta(&mut self, dst: &NodeId) {
        if let Some(m) = &mut self.meta {
            m.del(&Self::metadata_key(dst));
        }
    }
}

/// All edge fields owned by a node, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeFieldContainer {
    fields: std::collections::BTreeMap<String, EdgeField>,
}

impl EdgeFieldContainer {
    pub fn get(&self, field: &str) -> Option<&EdgeField> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &EdgeField)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Adds an arc, creating the field lazily. Enforces `SINGLE_REF` by
    /// replacing any existing arc and `BIDIRECTIONAL` by also requiring the
    /// caller install the inverse arc (see `Hierarchy::add_edge`).
    pub(crate) fn add_arc(
        &mut self,
        field: &str,
        constraint: &EdgeFieldConstraint,
        src: NodeId,
        src_type: [u8; selva_core::NODE_TYPE_CODE_LEN],
        dst: NodeId,
    ) -> DbResult<Option<NodeId>> {
        if let Some(expected) = constraint.src_type {
            if expected != src_type {
                return EdgeConstraintViolationSnafu {
                    field: field.to_string(),
                    src,
                    dst,
                    reason: "source node type does not match constraint".to_string(),
                }
                .fail();
            }
        }
        let entry = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| EdgeField::new(constraint.id.clone()));

        if constraint.flags.single_ref {
            let replaced = entry.arcs.iter().next().copied();
            if replaced == Some(dst) {
                return EdgeAlreadyExistsSnafu { field: field.to_string(), src, dst }.fail();
            }
            entry.arcs.clear();
            entry.arcs.insert(dst);
            if let Some(old) = replaced {
                entry.remove_meta(&old);
            }
            return Ok(replaced);
        }

        if !entry.arcs.insert(dst) {
            return EdgeAlreadyExistsSnafu { field: field.to_string(), src, dst }.fail();
        }
        Ok(None)
    }

    pub(crate) fn remove_arc(&mut self, field: &str, dst: &NodeId) -> bool {
        let Some(entry) = self.fields.get_mut(field) else { return false };
        let removed = entry.arcs.remove(dst);
        if removed {
            entry.remove_meta(dst);
        }
        removed
    }

    pub(crate) fn clear_field(&mut self, field: &str) -> Vec<NodeId> {
        match self.fields.remove(field) {
            Some(f) => f.arcs.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Removes every arc pointing at `dst` across all fields; used when a
    /// node is deleted so other nodes' edge fields stay referentially
    /// consistent.
    pub(crate) fn remove_all_arcs_to(&mut self, dst: &NodeId) {
        for field in self.fields.values_mut() {
            if field.arcs.remove(dst) {
                field.remove_meta(dst);
            }
        }
    }

    /// Mutable access to a destination's per-arc metadata object (the
    /// modify operation's edge-meta-op triplet), lazily creating it when
    /// `create` is set.
    pub fn metadata_mut(&mut self, field: &str, dst: &NodeId, create: bool) -> DbResult<Option<&mut Object>> {
        match self.fields.get_mut(field) {
            Some(f) => f.metadata_mut(dst, create),
            None => Ok(None),
        }
    }
}
