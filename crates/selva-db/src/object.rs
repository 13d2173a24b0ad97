//! The schemaless per-node key-value store (§4.2).
//!
//! Keys are dot-path strings resolved through a "layered container lookup":
//! at each level we first check whether the *entire remaining path* is a
//! literal key of the current object (so keys containing a literal `.` are
//! still reachable) and only split on the first `.` when that fails.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use selva_core::NodeId;

use crate::error::{DbError, ObjectWrongTypeSnafu};

/// One value stored under an [`Object`] key.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectValue {
    Null,
    Long(i64),
    Double(f64),
    String(String),
    Object(Object),
    Set(SetValue),
    Array(Vec<ObjectValue>),
    /// An opaque, application-defined blob tagged with its type name. The
    /// wire-level reply encoding for these is a command-dispatch concern.
    Pointer { type_tag: String, data: Vec<u8> },
}

impl ObjectValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectValue::Null => "null",
            ObjectValue::Long(_) => "long",
            ObjectValue::Double(_) => "double",
            ObjectValue::String(_) => "string",
            ObjectValue::Object(_) => "object",
            ObjectValue::Set(s) => s.kind_name(),
            ObjectValue::Array(_) => "array",
            ObjectValue::Pointer { .. } => "pointer",
        }
    }
}

/// A homogeneously-typed set. The four element kinds are disjoint: adding a
/// string to a long set (or vice versa) is a type error, never a coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Strings(BTreeSet<String>),
    Longs(BTreeSet<i64>),
    /// `f64` has no total order; membership is by exact bit pattern, kept
    /// sorted only for deterministic iteration.
    Doubles(Vec<f64>),
    NodeIds(BTreeSet<NodeId>),
}

/// A single element being added to or removed from a [`SetValue`].
#[derive(Debug, Clone, PartialEq)]
pub enum SetMember {
    Str(String),
    Long(i64),
    Double(f64),
    NodeId(NodeId),
}

impl SetMember {
    fn kind_name(&self) -> &'static str {
        match self {
            SetMember::Str(_) => "string_set",
            SetMember::Long(_) => "long_set",
            SetMember::Double(_) => "double_set",
            SetMember::NodeId(_) => "nodeid_set",
        }
    }
}

impl SetValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SetValue::Strings(_) => "string_set",
            SetValue::Longs(_) => "long_set",
            SetValue::Doubles(_) => "double_set",
            SetValue::NodeIds(_) => "nodeid_set",
        }
    }

    fn empty_for(member: &SetMember) -> Self {
        match member {
            SetMember::Str(_) => SetValue::Strings(BTreeSet::new()),
            SetMember::Long(_) => SetValue::Longs(BTreeSet::new()),
            SetMember::Double(_) => SetValue::Doubles(Vec::new()),
            SetMember::NodeId(_) => SetValue::NodeIds(BTreeSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SetValue::Strings(s) => s.len(),
            SetValue::Longs(s) => s.len(),
            SetValue::Doubles(s) => s.len(),
            SetValue::NodeIds(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `member`, returning whether it was new. `Err` carries this
    /// set's kind name when `member`'s kind doesn't match.
    pub fn insert(&mut self, member: SetMember) -> Result<bool, &'static str> {
        match (self, &member) {
            (SetValue::Strings(s), SetMember::Str(v)) => Ok(s.insert(v.clone())),
            (SetValue::Longs(s), SetMember::Long(v)) => Ok(s.insert(*v)),
            (SetValue::Doubles(s), SetMember::Double(v)) => {
                if s.iter().any(|x| x.to_bits() == v.to_bits()) {
                    Ok(false)
                } else {
                    s.push(*v);
                    s.sort_by(|a, b| a.total_cmp(b));
                    Ok(true)
                }
            }
            (SetValue::NodeIds(s), SetMember::NodeId(v)) => Ok(s.insert(*v)),
            (this, _) => Err(this.kind_name()),
        }
    }

    pub fn remove(&mut self, member: &SetMember) -> Result<bool, &'static str> {
        match (self, member) {
            (SetValue::Strings(s), SetMember::Str(v)) => Ok(s.remove(v)),
            (SetValue::Longs(s), SetMember::Long(v)) => Ok(s.remove(v)),
            (SetValue::Doubles(s), SetMember::Double(v)) => {
                let before = s.len();
                s.retain(|x| x.to_bits() != v.to_bits());
                Ok(before != s.len())
            }
            (SetValue::NodeIds(s), SetMember::NodeId(v)) => Ok(s.remove(v)),
            (this, _) => Err(this.kind_name()),
        }
    }
}

/// One entry in an [`Object`]: a value plus its 16-bit user-metadata word.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub value: ObjectValue,
    pub meta: u16,
}

impl ObjectEntry {
    fn scalar(value: ObjectValue) -> Self {
        Self { value, meta: 0 }
    }
}

/// Whether a scalar write happens unconditionally, only over an existing
/// key, or only to fill one in that's absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Set,
    UpdateOnly,
    DefaultOnly,
}

/// Ordered (insertion order) schemaless key-value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    entries: IndexMap<String, ObjectEntry>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ObjectEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Greedy key resolution: the whole remaining path first, then split on
    /// the first `.`.
    fn next_segment<'a>(&self, path: &'a str) -> (&'a str, Option<&'a str>) {
        if self.entries.contains_key(path) {
            (path, None)
        } else if let Some(idx) = path.find('.') {
            (&path[..idx], Some(&path[idx + 1..]))
        } else {
            (path, None)
        }
    }

    pub fn get(&self, path: &str) -> Option<&ObjectValue> {
        let (head, rest) = self.next_segment(path);
        let entry = self.entries.get(head)?;
        match rest {
            None => Some(&entry.value),
            Some(rest) => match &entry.value {
                ObjectValue::Object(inner) => inner.get(rest),
                _ => None,
            },
        }
    }

    pub fn get_meta(&self, path: &str) -> Option<u16> {
        let (head, rest) = self.next_segment(path);
        let entry = self.entries.get(head)?;
        match rest {
            None => Some(entry.meta),
            Some(rest) => match &entry.value {
                ObjectValue::Object(inner) => inner.get_meta(rest),
                _ => None,
            },
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn type_name(&self, path: &str) -> Option<&'static str> {
        self.get(path).map(ObjectValue::kind_name)
    }

    pub fn len_of(&self, path: &str) -> DbResult<usize> {
        match self.get(path) {
            Some(ObjectValue::Array(a)) => Ok(a.len()),
            Some(ObjectValue::Set(s)) => Ok(s.len()),
            Some(ObjectValue::Object(o)) => Ok(o.entries.len()),
            Some(other) => ObjectWrongTypeSnafu {
                field: path.to_string(),
                expected: "array, set, or object",
                found: other.kind_name(),
            }
            .fail(),
            None => Ok(0),
        }
    }

    /// Removes a key, auto-creating nothing. Returns whether it existed.
    pub fn del(&mut self, path: &str) -> bool {
        let (head, rest) = self.next_segment(path);
        match rest {
            None => self.entries.shift_remove(head).is_some(),
            Some(rest) => {
                let head = head.to_string();
                match self.entries.get_mut(&head).map(|e| &mut e.value) {
                    Some(ObjectValue::Object(inner)) => inner.del(&rest),
                    _ => false,
                }
            }
        }
    }

    /// Walks (creating nested objects as needed) to the parent object that
    /// should own `path`'s leaf segment, returning that parent and the leaf
    /// key name. Fails if an intermediate segment exists but isn't an
    /// object.
    fn ensure_parent_mut<'a>(obj: &'a mut Object, path: &str) -> DbResult<(&'a mut Object, String)> {
        let (head, rest) = obj.next_segment(path);
        let head = head.to_string();
        match rest {
            None => Ok((obj, head)),
            Some(rest) => {
                let rest = rest.to_string();
                let entry = obj
                    .entries
                    .entry(head.clone())
                    .or_insert_with(|| ObjectEntry::scalar(ObjectValue::Object(Object::new())));
                match &mut entry.value {
                    ObjectValue::Object(inner) => Self::ensure_parent_mut(inner, &rest),
                    other => ObjectWrongTypeSnafu {
                        field: head,
                        expected: "object",
                        found: other.kind_name(),
                    }
                    .fail(),
                }
            }
        }
    }

    /// Returns the nested [`Object`] at `path`, creating it (and any missing
    /// intermediate objects) if absent. Fails if an existing value at `path`
    /// is a non-object scalar.
    pub fn ensure_object_mut(&mut self, path: &str) -> DbResult<&mut Object> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let entry = parent
            .entries
            .entry(leaf.clone())
            .or_insert_with(|| ObjectEntry::scalar(ObjectValue::Object(Object::new())));
        match &mut entry.value {
            ObjectValue::Object(inner) => Ok(inner),
            other => {
                ObjectWrongTypeSnafu { field: leaf, expected: "object", found: other.kind_name() }
                    .fail()
            }
        }
    }

    /// Generic scalar write, used by [`Object::set_long`]/`set_string`/etc.
    /// and directly by the modify operation, which already has a typed
    /// [`ObjectValue`] in hand.
    pub fn set_scalar(&mut self, path: &str, value: ObjectValue, mode: SetMode) -> DbResult<bool> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let existed = parent.entries.contains_key(&leaf);
        match mode {
            SetMode::UpdateOnly if !existed => return Ok(false),
            SetMode::DefaultOnly if existed => return Ok(false),
            _ => {}
        }
        let changed = parent.entries.get(&leaf).is_none_or(|e| e.value != value);
        parent
            .entries
            .entry(leaf)
            .and_modify(|e| e.value = value.clone())
            .or_insert_with(|| ObjectEntry::scalar(value));
        Ok(changed)
    }

    pub fn set_long(&mut self, path: &str, v: i64, mode: SetMode) -> DbResult<bool> {
        self.set_scalar(path, ObjectValue::Long(v), mode)
    }

    pub fn set_double(&mut self, path: &str, v: f64, mode: SetMode) -> DbResult<bool> {
        self.set_scalar(path, ObjectValue::Double(v), mode)
    }

    pub fn set_string(&mut self, path: &str, v: impl Into<String>, mode: SetMode) -> DbResult<bool> {
        self.set_scalar(path, ObjectValue::String(v.into()), mode)
    }

    pub fn set_null(&mut self, path: &str, mode: SetMode) -> DbResult<bool> {
        self.set_scalar(path, ObjectValue::Null, mode)
    }

    pub fn set_meta(&mut self, path: &str, meta: u16) -> DbResult<bool> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let changed = parent.entries.get(&leaf).is_none_or(|e| e.meta != meta);
        parent
            .entries
            .entry(leaf)
            .and_modify(|e| e.meta = meta)
            .or_insert_with(|| ObjectEntry { value: ObjectValue::Null, meta });
        Ok(changed)
    }

    pub fn increment_long(&mut self, path: &str, by: i64) -> DbResult<i64> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let entry = parent
            .entries
            .entry(leaf.clone())
            .or_insert_with(|| ObjectEntry::scalar(ObjectValue::Long(0)));
        match &mut entry.value {
            ObjectValue::Long(n) => {
                *n += by;
                Ok(*n)
            }
            other => ObjectWrongTypeSnafu { field: leaf, expected: "long", found: other.kind_name() }
                .fail(),
        }
    }

    pub fn increment_double(&mut self, path: &str, by: f64) -> DbResult<f64> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let entry = parent
            .entries
            .entry(leaf.clone())
            .or_insert_with(|| ObjectEntry::scalar(ObjectValue::Double(0.0)));
        match &mut entry.value {
            ObjectValue::Double(n) => {
                *n += by;
                Ok(*n)
            }
            other => {
                ObjectWrongTypeSnafu { field: leaf, expected: "double", found: other.kind_name() }
                    .fail()
            }
        }
    }

    /// Adds a member to the set at `path`, creating an empty set of the
    /// member's kind if absent. Fails if the existing set has a different
    /// element kind.
    pub fn add_set_member(&mut self, path: &str, member: SetMember) -> DbResult<bool> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let entry = parent.entries.entry(leaf.clone()).or_insert_with(|| {
            ObjectEntry::scalar(ObjectValue::Set(SetValue::empty_for(&member)))
        });
        match &mut entry.value {
            ObjectValue::Set(set) => set.insert(member).map_err(|found| {
                ObjectWrongTypeSnafu { field: leaf, expected: found, found: member.kind_name() }
                    .build()
            }),
            other => ObjectWrongTypeSnafu { field: leaf, expected: "set", found: other.kind_name() }
                .fail(),
        }
    }

    pub fn remove_set_member(&mut self, path: &str, member: &SetMember) -> DbResult<bool> {
        match self.get_mut(path) {
            Some(ObjectValue::Set(set)) => set.remove(member).map_err(|found| {
                ObjectWrongTypeSnafu {
                    field: path.to_string(),
                    expected: found,
                    found: member.kind_name(),
                }
                .build()
            }),
            Some(other) => ObjectWrongTypeSnafu {
                field: path.to_string(),
                expected: "set",
                found: other.kind_name(),
            }
            .fail(),
            None => Ok(false),
        }
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut ObjectValue> {
        let (head, rest) = self.next_segment(path);
        let head = head.to_string();
        let entry = self.entries.get_mut(&head)?;
        match rest {
            None => Some(&mut entry.value),
            Some(rest) => match &mut entry.value {
                ObjectValue::Object(inner) => inner.get_mut(&rest),
                _ => None,
            },
        }
    }

    pub fn get_array(&self, path: &str) -> Option<&[ObjectValue]> {
        match self.get(path) {
            Some(ObjectValue::Array(a)) => Some(a.as_slice()),
            _ => None,
        }
    }

    fn array_mut<'a>(&'a mut self, path: &str) -> DbResult<&'a mut Vec<ObjectValue>> {
        let (parent, leaf) = Self::ensure_parent_mut(self, path)?;
        let entry = parent
            .entries
            .entry(leaf.clone())
            .or_insert_with(|| ObjectEntry::scalar(ObjectValue::Array(Vec::new())));
        match &mut entry.value {
            ObjectValue::Array(a) => Ok(a),
            other => ObjectWrongTypeSnafu { field: leaf, expected: "array", found: other.kind_name() }
                .fail(),
        }
    }

    pub fn insert_array(&mut self, path: &str, values: impl IntoIterator<Item = ObjectValue>) -> DbResult<()> {
        self.array_mut(path)?.extend(values);
        Ok(())
    }

    /// Pushes `values` then trims the front so at most `max_len` items
    /// remain (a bounded queue).
    pub fn queue_trim_array(
        &mut self,
        path: &str,
        values: impl IntoIterator<Item = ObjectValue>,
        max_len: usize,
    ) -> DbResult<()> {
        let arr = self.array_mut(path)?;
        arr.extend(values);
        if arr.len() > max_len {
            let excess = arr.len() - max_len;
            arr.drain(0..excess);
        }
        Ok(())
    }

    pub fn insert_array_index(&mut self, path: &str, idx: usize, value: ObjectValue) -> DbResult<()> {
        let arr = self.array_mut(path)?;
        if idx > arr.len() {
            return crate::error::RangeSnafu { msg: format!("array index {idx} out of bounds") }
                .fail();
        }
        arr.insert(idx, value);
        Ok(())
    }

    pub fn assign_array_index(&mut self, path: &str, idx: usize, value: ObjectValue) -> DbResult<()> {
        let arr = self.array_mut(path)?;
        if idx >= arr.len() {
            return crate::error::RangeSnafu { msg: format!("array index {idx} out of bounds") }
                .fail();
        }
        arr[idx] = value;
        Ok(())
    }

    pub fn remove_array_index(&mut self, path: &str, idx: usize) -> DbResult<ObjectValue> {
        let arr = self.array_mut(path)?;
        if idx >= arr.len() {
            return crate::error::RangeSnafu { msg: format!("array index {idx} out of bounds") }
                .fail();
        }
        Ok(arr.remove(idx))
    }
}

use crate::error::DbResult;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_auto_create() {
        let mut obj = Object::new();
        assert!(obj.set_string("profile.title", "hi", SetMode::Set).unwrap());
        assert_eq!(obj.get("profile.title"), Some(&ObjectValue::String("hi".into())));
    }

    #[test]
    fn dotted_literal_key_wins_over_split() {
        let mut obj = Object::new();
        obj.set_string("a.b", "literal", SetMode::Set).unwrap();
        assert_eq!(obj.get("a.b"), Some(&ObjectValue::String("literal".into())));
    }

    #[test]
    fn update_default_semantics() {
        let mut obj = Object::new();
        assert!(!obj.set_long("x", 1, SetMode::UpdateOnly).unwrap());
        assert!(obj.set_long("x", 1, SetMode::DefaultOnly).unwrap());
        assert!(!obj.set_long("x", 2, SetMode::DefaultOnly).unwrap());
        assert!(obj.set_long("x", 2, SetMode::UpdateOnly).unwrap());
        assert_eq!(obj.get("x"), Some(&ObjectValue::Long(2)));
    }

    #[test]
    fn set_kind_mismatch_is_type_error() {
        let mut obj = Object::new();
        obj.add_set_member("tags", SetMember::Str("a".into())).unwrap();
        let err = obj.add_set_member("tags", SetMember::Long(1)).unwrap_err();
        assert!(matches!(err, DbError::ObjectWrongType { .. }));
    }

    #[test]
    fn array_ops() {
        let mut obj = Object::new();
        obj.insert_array("list", [ObjectValue::Long(1), ObjectValue::Long(2)]).unwrap();
        obj.insert_array_index("list", 1, ObjectValue::Long(99)).unwrap();
        assert_eq!(obj.get_array("list").unwrap().len(), 3);
        obj.assign_array_index("list", 0, ObjectValue::Long(0)).unwrap();
        let removed = obj.remove_array_index("list", 1).unwrap();
        assert_eq!(removed, ObjectValue::Long(99));
        assert_eq!(obj.get_array("list").unwrap(), &[ObjectValue::Long(0), ObjectValue::Long(2)]);
    }

    #[test]
    fn increment_creates_zero_then_adds() {
        let mut obj = Object::new();
        assert_eq!(obj.increment_long("n", 5).unwrap(), 5);
        assert_eq!(obj.increment_long("n", -2).unwrap(), 3);
    }
}
