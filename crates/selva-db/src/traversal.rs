//! DFS/BFS walkers over the hierarchy and edge fields, plus the
//! expression-driven variant that picks fields to follow dynamically (§4.3).

use std::collections::{BTreeSet, VecDeque};

use selva_core::NodeId;
use selva_rpn::{EvalContext, Expr, Value};

use crate::error::{DbResult, TraversalMaxDepthExceededSnafu};
use crate::hierarchy::Hierarchy;
use crate::object::ObjectValue;

bitflags::bitflags! {
    /// Which adjacency a traversal follows. Treated as a bitset so one
    /// operation (an expression-driven traversal's per-node field set) can
    /// name several kinds of adjacency at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Direction: u32 {
        const NODE              = 1 << 0;
        const ARRAY              = 1 << 1;
        const SET                = 1 << 2;
        const REF                = 1 << 3;
        const EDGE_FIELD         = 1 << 4;
        const CHILDREN           = 1 << 5;
        const PARENTS            = 1 << 6;
        const BFS_ANCESTORS      = 1 << 7;
        const BFS_DESCENDANTS    = 1 << 8;
        const DFS_ANCESTORS      = 1 << 9;
        const DFS_DESCENDANTS    = 1 << 10;
        const DFS_FULL           = 1 << 11;
        const BFS_EDGE_FIELD     = 1 << 12;
        const BFS_EXPRESSION     = 1 << 13;
        const EXPRESSION         = 1 << 14;
    }
}

/// A safety ceiling on traversal depth, guarding against pathological or
/// (despite the DAG invariant) accidentally cyclic hierarchies.
pub const MAX_TRAVERSAL_DEPTH: usize = 4096;

/// Callback surface for a traversal. All methods have no-op defaults so
/// callers implement only what they need.
pub trait TraversalVisitor {
    /// Fires once for the starting node.
    fn head(&mut self, _node: NodeId) {}
    /// Fires for each visited node. Returning `true` stops the traversal.
    fn node(&mut self, _node: NodeId) -> bool {
        false
    }
    /// Fires for each adjacency discovered, naming the field it came
    /// through and the node it came from.
    fn child(&mut self, _field: &str, _from: NodeId, _to: NodeId) {}
}

/// A [`TraversalVisitor`] that just collects every visited node, in visit
/// order, excluding the head (matching the `HierarchyReply_WithTraversal`
/// skip-head rule for ancestor/descendant queries).
#[derive(Debug, Default)]
pub struct CollectVisitor {
    pub nodes: Vec<NodeId>,
}

impl TraversalVisitor for CollectVisitor {
    fn node(&mut self, node: NodeId) -> bool {
        self.nodes.push(node);
        false
    }
}

fn adjacency<'h>(h: &'h Hierarchy, node: NodeId, dir: Direction) -> Vec<(String, NodeId)> {
    let Some(n) = h.find_node(node) else { return Vec::new() };
    if dir.contains(Direction::PARENTS) || dir.intersects(Direction::DFS_ANCESTORS | Direction::BFS_ANCESTORS) {
        n.parents().map(|p| ("parents".to_string(), *p)).collect()
    } else {
        n.children().map(|c| ("children".to_string(), *c)).collect()
    }
}

/// DFS pre-order (parents-first for ancestors, children-first for
/// descendants). Cycle-safe via transaction stamping.
pub fn dfs(h: &mut Hierarchy, start: NodeId, ancestors: bool, visitor: &mut impl TraversalVisitor) -> DbResult<()> {
    let stamp = h.begin_traversal();
    h.stamp_visited(start, stamp);
    visitor.head(start);
    dfs_inner(h, start, ancestors, stamp, 0, visitor)
}

fn dfs_inner(
    h: &mut Hierarchy,
    node: NodeId,
    ancestors: bool,
    stamp: u64,
    depth: usize,
    visitor: &mut impl TraversalVisitor,
) -> DbResult<()> {
    if depth > MAX_TRAVERSAL_DEPTH {
        return TraversalMaxDepthExceededSnafu {}.fail();
    }
    let dir = if ancestors { Direction::PARENTS } else { Direction::CHILDREN };
    for (field, next) in adjacency(h, node, dir) {
        visitor.child(&field, node, next);
        if h.stamp_visited(next, stamp) {
            if visitor.node(next) {
                return Ok(());
            }
            dfs_inner(h, next, ancestors, stamp, depth + 1, visitor)?;
        }
    }
    Ok(())
}

/// BFS level-order. The starting node is visited first, then skipped from
/// the `node` callback here; callers that want it in the result set add it
/// themselves (e.g. for `hierarchy.inherit`, which starts at the query node).
pub fn bfs(h: &mut Hierarchy, start: NodeId, ancestors: bool, visitor: &mut impl TraversalVisitor) -> DbResult<()> {
    let stamp = h.begin_traversal();
    visitor.head(start);
    h.stamp_visited(start, stamp);
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(start);
    let mut depth = 0usize;
    while let Some(node) = queue.pop_front() {
        depth += 1;
        if depth > MAX_TRAVERSAL_DEPTH {
            return TraversalMaxDepthExceededSnafu {}.fail();
        }
        let dir = if ancestors { Direction::PARENTS } else { Direction::CHILDREN };
        for (field, next) in adjacency(h, node, dir) {
            visitor.child(&field, node, next);
            if h.stamp_visited(next, stamp) {
                if visitor.node(next) {
                    return Ok(());
                }
                queue.push_back(next);
            }
        }
    }
    Ok(())
}

/// BFS following a single named edge field instead of parents/children.
pub fn bfs_edge_field(h: &mut Hierarchy, start: NodeId, field: &str, visitor: &mut impl TraversalVisitor) -> DbResult<()> {
    let stamp = h.begin_traversal();
    visitor.head(start);
    h.stamp_visited(start, stamp);
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(start);
    while let Some(node) = queue.pop_front() {
        let arcs: Vec<NodeId> = h
            .find_node(node)
            .and_then(|n| n.edges.get(field))
            .map(|ef| ef.arcs().copied().collect())
            .unwrap_or_default();
        for next in arcs {
            visitor.child(field, node, next);
            if h.stamp_visited(next, stamp) {
                if visitor.node(next) {
                    return Ok(());
                }
                queue.push_back(next);
            }
        }
    }
    Ok(())
}

/// `DFS_FULL`: depth-first over the union of ancestors and descendants,
/// used by whole-hierarchy sweeps (detached markers, compression).
pub fn dfs_full(h: &mut Hierarchy, start: NodeId, visitor: &mut impl TraversalVisitor) -> DbResult<()> {
    let mut collect_up = CollectVisitor::default();
    dfs(h, start, true, &mut collect_up)?;
    let mut collect_down = CollectVisitor::default();
    dfs(h, start, false, &mut collect_down)?;
    visitor.head(start);
    for n in collect_up.nodes.into_iter().chain(collect_down.nodes) {
        if visitor.node(n) {
            return Ok(());
        }
    }
    Ok(())
}

/// An [`EvalContext`] over a live hierarchy, with register 0 bound to the
/// node currently being visited.
pub struct HierarchyEvalContext<'h> {
    pub hierarchy: &'h Hierarchy,
    pub current: NodeId,
}

impl EvalContext for HierarchyEvalContext<'_> {
    fn register_node(&self, idx: u8) -> Option<NodeId> {
        (idx == 0).then_some(self.current)
    }

    fn field(&self, node: NodeId, field: &str) -> Option<Value> {
        let n = self.hierarchy.find_node(node)?;
        object_value_to_rpn(n.object.get(field)?)
    }
}

/// Maps an [`ObjectValue`] to the narrower value shape the RPN evaluator
/// understands. Nested objects and non-string sets/arrays have no
/// representation here and evaluate as absent (`None`), matching "missing
/// field is null" in the evaluator's contract.
pub fn object_value_to_rpn(v: &ObjectValue) -> Option<Value> {
    match v {
        ObjectValue::Null => Some(Value::Null),
        ObjectValue::Long(n) => Some(Value::Double(*n as f64)),
        ObjectValue::Double(d) => Some(Value::Double(*d)),
        ObjectValue::String(s) => Some(Value::String(s.clone())),
        ObjectValue::Set(crate::object::SetValue::Strings(s)) => Some(Value::StringSet(s.clone())),
        ObjectValue::Set(crate::object::SetValue::NodeIds(s)) => {
            Some(Value::StringSet(s.iter().map(|id| id.to_string()).collect()))
        }
        _ => None,
    }
}

/// Resolves the field names an expression-driven traversal should follow
/// from `node`, then yields `(field, target)` pairs: hierarchy pseudo-fields
/// resolve to parents/children, edge-field names to their arcs, and object
/// fields holding a node-id set/array to those ids.
pub fn expression_candidates(h: &Hierarchy, node: NodeId, expr: &Expr) -> DbResult<Vec<(String, NodeId)>> {
    let ctx = HierarchyEvalContext { hierarchy: h, current: node };
    let fields = selva_rpn::eval_string_set(expr, &ctx)?;
    let mut out = Vec::new();
    let Some(n) = h.find_node(node) else { return Ok(out) };

    for field in fields {
        match field.as_str() {
            "parents" | "ancestors" => out.extend(n.parents().map(|p| (field.clone(), *p))),
            "children" | "descendants" => out.extend(n.children().map(|c| (field.clone(), *c))),
            _ => {
                if let Some(ef) = n.edges.get(&field) {
                    out.extend(ef.arcs().map(|a| (field.clone(), *a)));
                } else if let Some(value) = n.object.get(&field) {
                    collect_node_refs(value, &field, &mut out);
                }
            }
        }
    }
    Ok(out)
}

fn collect_node_refs(value: &ObjectValue, field: &str, out: &mut Vec<(String, NodeId)>) {
    match value {
        ObjectValue::Set(crate::object::SetValue::NodeIds(ids)) => {
            out.extend(ids.iter().map(|id| (field.to_string(), *id)));
        }
        ObjectValue::Set(crate::object::SetValue::Strings(ids)) => {
            out.extend(ids.iter().filter_map(|s| s.parse::<NodeId>().ok()).map(|id| (field.to_string(), id)));
        }
        ObjectValue::Array(items) => {
            for item in items {
                if let ObjectValue::String(s) = item {
                    if let Ok(id) = s.parse::<NodeId>() {
                        out.push((field.to_string(), id));
                    }
                }
            }
        }
        _ => {}
    }
}

/// BFS/queue-order expression-driven traversal (`BFS_EXPRESSION` /
/// `EXPRESSION`). An optional edge filter vetoes individual candidate arcs.
pub fn expression_traversal(
    h: &mut Hierarchy,
    start: NodeId,
    field_expr: &Expr,
    edge_filter: Option<&Expr>,
    visitor: &mut impl TraversalVisitor,
) -> DbResult<()> {
    let stamp = h.begin_traversal();
    visitor.head(start);
    h.stamp_visited(start, stamp);
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    queue.push_back(start);
    let mut depth = 0usize;
    while let Some(node) = queue.pop_front() {
        depth += 1;
        if depth > MAX_TRAVERSAL_DEPTH {
            return TraversalMaxDepthExceededSnafu {}.fail();
        }
        let candidates = expression_candidates(h, node, field_expr)?;
        for (field, next) in candidates {
            if let Some(filter) = edge_filter {
                let ctx = HierarchyEvalContext { hierarchy: h, current: next };
                if !selva_rpn::eval_bool(Some(filter), &ctx)? {
                    continue;
                }
            }
            visitor.child(&field, node, next);
            if h.stamp_visited(next, stamp) {
                if visitor.node(next) {
                    return Ok(());
                }
                queue.push_back(next);
            }
        }
    }
    Ok(())
}

/// The sort key of an [`OrderItem`]: a sum type so the comparator stays
/// branch-free inside each arm, with the secondary node-id comparator kept
/// outside the variant (per design note).
#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Empty,
    Double(f64),
    /// Raw UTF-8 bytes of the sort field; locale-aware collation is out of
    /// scope, so ordering is a plain byte compare.
    Text(Vec<u8>),
}

impl SortKey {
    fn rank(&self) -> u8 {
        match self {
            SortKey::Empty => 0,
            SortKey::Double(_) => 1,
            SortKey::Text(_) => 2,
        }
    }

    pub fn from_value(v: Option<&ObjectValue>) -> Self {
        match v {
            None | Some(ObjectValue::Null) => SortKey::Empty,
            Some(ObjectValue::Long(n)) => SortKey::Double(*n as f64),
            Some(ObjectValue::Double(d)) => SortKey::Double(*d),
            Some(ObjectValue::String(s)) => SortKey::Text(s.clone().into_bytes()),
            _ => SortKey::Empty,
        }
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (SortKey::Double(a), SortKey::Double(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Empty, SortKey::Empty) => std::cmp::Ordering::Equal,
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// A visited node wrapped with its sort key; compares by key first and
/// falls back to node id so the order is total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub node: NodeId,
    pub key: SortKey,
}

impl PartialOrd for OrderItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.node.cmp(&other.node))
    }
}

/// Sorts visited nodes ascending/descending by a named field, producing
/// [`OrderItem`]s (§4.3 "Ordering of results").
pub fn order_by_field(h: &Hierarchy, nodes: impl IntoIterator<Item = NodeId>, field: &str, descending: bool) -> Vec<OrderItem> {
    let mut items: Vec<OrderItem> = nodes
        .into_iter()
        .map(|node| {
            let key = h
                .find_node(node)
                .map(|n| SortKey::from_value(n.object.get(field)))
                .unwrap_or(SortKey::Empty);
            OrderItem { node, key }
        })
        .collect();
    items.sort();
    if descending {
        items.reverse();
    }
    items
}

/// Nodes reachable from `start` in the given pseudo-direction, via
/// `dir`: must be exactly one of `BFS_ANCESTORS`/`BFS_DESCENDANTS`/
/// `DFS_ANCESTORS`/`DFS_DESCENDANTS`. Convenience wrapper used by tests and
/// by `hierarchy.find`'s non-indexed path.
pub fn reachable(h: &mut Hierarchy, start: NodeId, dir: Direction) -> DbResult<BTreeSet<NodeId>> {
    let mut v = CollectVisitor::default();
    if dir.contains(Direction::BFS_ANCESTORS) {
        bfs(h, start, true, &mut v)?;
    } else if dir.contains(Direction::BFS_DESCENDANTS) {
        bfs(h, start, false, &mut v)?;
    } else if dir.contains(Direction::DFS_ANCESTORS) {
        dfs(h, start, true, &mut v)?;
    } else if dir.contains(Direction::DFS_DESCENDANTS) {
        dfs(h, start, false, &mut v)?;
    }
    Ok(v.nodes.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use selva_core::Timestamp;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn bfs_descendants_skips_start_in_collect_visitor() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("a"), &[], &[id("c")], Timestamp::ZERO).unwrap();
        let reached = reachable(&mut h, id("a"), Direction::BFS_DESCENDANTS).unwrap();
        assert!(reached.contains(&id("c")));
        assert!(!reached.contains(&id("a")));
    }

    #[test]
    fn dfs_ancestors_s1_scenario() {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("c"), &[id("a"), id("b")], &[], Timestamp::ZERO).unwrap();
        h.set_hierarchy(id("d"), &[id("b")], &[], Timestamp::ZERO).unwrap();

        let ancestors_c = reachable(&mut h, id("c"), Direction::DFS_ANCESTORS).unwrap();
        assert_eq!(ancestors_c, [id("a"), id("b")].into_iter().collect());

        let ancestors_d = reachable(&mut h, id("d"), Direction::DFS_ANCESTORS).unwrap();
        assert_eq!(ancestors_d, [id("b")].into_iter().collect());

        let descendants_b = reachable(&mut h, id("b"), Direction::DFS_DESCENDANTS).unwrap();
        assert_eq!(descendants_b, [id("c"), id("d")].into_iter().collect());
    }

    #[test]
    fn order_item_total_order() {
        let mut a = OrderItem { node: id("a"), key: SortKey::Double(1.0) };
        let b = OrderItem { node: id("b"), key: SortKey::Empty };
        assert!(b < a);
        a.key = SortKey::Empty;
        assert!(a < b || b < a || a == b);
    }
}
