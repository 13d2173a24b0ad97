//! Result shaping for `hierarchy.find` and `hierarchy.inherit` (§4.3):
//! candidate collection (transparently served from a materialized ICB
//! when one is active), filtering, ordering/paging, and field shaping
//! under the four merge strategies.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use selva_core::{NodeId, Timestamp};
use selva_rpn::Expr;
use snafu::ensure;

use crate::config::Config;
use crate::error::{DbResult, IncompatibleQuerySnafu};
use crate::hierarchy::Hierarchy;
use crate::indexing::{IndexDirection, IndexingEngine};
use crate::object::ObjectValue;
use crate::traversal::{self, CollectVisitor, Direction, HierarchyEvalContext};

/// How a query's traversal reaches its candidate set.
#[derive(Debug, Clone)]
pub enum FindTraversal {
    Direction(Direction),
    EdgeField(String),
    Expression { field_expr: Expr, edge_filter: Option<Expr> },
}

/// How field values are assembled per matched node (§4.3 "Result shaping").
#[derive(Debug, Clone, Default)]
pub enum MergeStrategy {
    #[default]
    None,
    All,
    Named(BTreeSet<String>),
    /// Recursively flattens nested objects into dotted field paths.
    Deep,
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub anchor: NodeId,
    pub traversal: FindTraversal,
    pub filter: Option<Expr>,
    pub order: Option<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub fields: Option<Vec<String>>,
    pub fields_rpn: Option<Expr>,
    pub excluded_fields: BTreeSet<String>,
    pub merge: MergeStrategy,
    /// `hierarchy.inherit`: a field absent on the matched node is resolved
    /// from the nearest ancestor (breadth-first) that has it.
    pub inherit: bool,
    /// Stamp passed through to the auto-indexer's popularity tracking.
    pub now: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindResultItem {
    pub node: NodeId,
    pub field: String,
    pub value: ObjectValue,
}

fn validate(opts: &FindOptions) -> DbResult<()> {
    if !matches!(opts.merge, MergeStrategy::None) {
        ensure!(
            opts.limit.is_none(),
            IncompatibleQuerySnafu { msg: "merge cannot be combined with limit (result order is not deterministic)" }
        );
        ensure!(
            opts.fields_rpn.is_none(),
            IncompatibleQuerySnafu { msg: "merge cannot be combined with fields_rpn" }
        );
    }
    Ok(())
}

/// Runs `hierarchy.find`/`hierarchy.inherit`: collect candidates (from a
/// live traversal or a materialized index), filter, order, page, then
/// shape into `[nodeId, fieldPath, value]` rows, deduplicated per
/// `(node, field path)`.
pub fn find(h: &mut Hierarchy, indexing: &mut IndexingEngine, config: &Config, opts: FindOptions) -> DbResult<Vec<FindResultItem>> {
    validate(&opts)?;

    let candidates = collect_candidates(h, indexing, config, &opts)?;

    let mut filtered = Vec::with_capacity(candidates.len());
    for node in candidates {
        if let Some(filter) = &opts.filter {
            let ctx = HierarchyEvalContext { hierarchy: h, current: node };
            if !selva_rpn::eval_bool(Some(filter), &ctx)? {
                continue;
            }
        }
        filtered.push(node);
    }

    let ordered: Vec<NodeId> = match &opts.order {
        Some((field, desc)) => traversal::order_by_field(h, filtered, field, *desc).into_iter().map(|i| i.node).collect(),
        None => filtered,
    };

    let page: Vec<NodeId> = ordered.into_iter().skip(opts.offset).take(opts.limit.unwrap_or(usize::MAX)).collect();

    let mut rows: BTreeMap<(NodeId, String), ObjectValue> = BTreeMap::new();
    for node in page {
        shape_node(h, node, &opts, &mut rows)?;
    }
    Ok(rows.into_iter().map(|((node, field), value)| FindResultItem { node, field, value }).collect())
}

/// Eligible directions for auto-indexing are `BFS_ANCESTORS`,
/// `BFS_DESCENDANTS`, and `BFS_EXPRESSION` (§4.5): consult (and register
/// popularity against) the ICB map; an active ICB serves its cached
/// membership directly instead of re-walking the hierarchy.
fn collect_candidates(h: &mut Hierarchy, indexing: &mut IndexingEngine, config: &Config, opts: &FindOptions) -> DbResult<Vec<NodeId>> {
    let icb_signature = match &opts.traversal {
        FindTraversal::Direction(dir) if dir.contains(Direction::BFS_ANCESTORS) => Some((IndexDirection::BfsAncestors, None)),
        FindTraversal::Direction(dir) if dir.contains(Direction::BFS_DESCENDANTS) => Some((IndexDirection::BfsDescendants, None)),
        FindTraversal::Expression { field_expr, .. } => Some((IndexDirection::BfsExpression, Some(field_expr.clone()))),
        _ => None,
    };

    if config.indexing_enabled() {
        if let Some((dir, dir_expr)) = icb_signature {
            let id = indexing.touch(opts.anchor, dir, dir_expr, opts.order.clone(), opts.filter.clone(), opts.now);
            if indexing.get(id).is_some_and(|icb| icb.active) {
                return Ok(indexing.materialized_nodes(h, id));
            }
        }
    }

    let mut collector = CollectVisitor::default();
    match &opts.traversal {
        FindTraversal::Direction(dir) => {
            if dir.contains(Direction::BFS_ANCESTORS) {
                traversal::bfs(h, opts.anchor, true, &mut collector)?;
            } else if dir.contains(Direction::BFS_DESCENDANTS) {
                traversal::bfs(h, opts.anchor, false, &mut collector)?;
            } else if dir.contains(Direction::DFS_ANCESTORS) {
                traversal::dfs(h, opts.anchor, true, &mut collector)?;
            } else {
                traversal::dfs(h, opts.anchor, false, &mut collector)?;
            }
        }
        FindTraversal::EdgeField(field) => traversal::bfs_edge_field(h, opts.anchor, field, &mut collector)?,
        FindTraversal::Expression { field_expr, edge_filter } => {
            traversal::expression_traversal(h, opts.anchor, field_expr, edge_filter.as_ref(), &mut collector)?
        }
    }
    Ok(collector.nodes)
}

fn field_set(h: &Hierarchy, node: NodeId, opts: &FindOptions) -> DbResult<BTreeSet<String>> {
    let mut fields = BTreeSet::new();
    if let Some(explicit) = &opts.fields {
        fields.extend(explicit.iter().cloned());
    }
    if let Some(expr) = &opts.fields_rpn {
        let ctx = HierarchyEvalContext { hierarchy: h, current: node };
        fields.extend(selva_rpn::eval_string_set(expr, &ctx)?);
    }
    match &opts.merge {
        MergeStrategy::All | MergeStrategy::Deep => {
            if let Some(n) = h.find_node(node) {
                fields.extend(n.object.keys().map(str::to_string));
            }
        }
        MergeStrategy::Named(names) => fields.extend(names.iter().cloned()),
        MergeStrategy::None => {}
    }
    for excluded in &opts.excluded_fields {
        fields.remove(excluded);
    }
    Ok(fields)
}

fn shape_node(h: &Hierarchy, node: NodeId, opts: &FindOptions, rows: &mut BTreeMap<(NodeId, String), ObjectValue>) -> DbResult<()> {
    let fields = field_set(h, node, opts)?;
    for field in fields {
        let value = if opts.inherit {
            resolve_inherited(h, node, &field)
        } else {
            h.find_node(node).and_then(|n| n.object.get(&field)).cloned()
        };
        let Some(value) = value else { continue };
        if matches!(opts.merge, MergeStrategy::Deep) {
            flatten_into(node, &field, &value, rows);
        } else {
            rows.insert((node, field), value);
        }
    }
    Ok(())
}

/// Nearest-ancestor-first lookup (`hierarchy.inherit`): breadth-first over
/// parents so a closer ancestor's value always wins over a more distant
/// one that happens to be visited later in a naive DFS.
fn resolve_inherited(h: &Hierarchy, node: NodeId, field: &str) -> Option<ObjectValue> {
    if let Some(v) = h.find_node(node).and_then(|n| n.object.get(field)) {
        return Some(v.clone());
    }
    let mut frontier: VecDeque<NodeId> = h.find_node(node)?.parents().copied().collect();
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    while let Some(p) = frontier.pop_front() {
        if !seen.insert(p) {
            continue;
        }
        let Some(n) = h.find_node(p) else { continue };
        if let Some(v) = n.object.get(field) {
            return Some(v.clone());
        }
        frontier.extend(n.parents().copied());
    }
    None
}

fn flatten_into(node: NodeId, prefix: &str, value: &ObjectValue, rows: &mut BTreeMap<(NodeId, String), ObjectValue>) {
    match value {
        ObjectValue::Object(o) => {
            for (k, entry) in o.iter() {
                flatten_into(node, &format!("{prefix}.{k}"), &entry.value, rows);
            }
        }
        other => {
            rows.insert((node, prefix.to_string()), other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SetMode;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn sample() -> Hierarchy {
        let mut h = Hierarchy::new();
        h.set_hierarchy(id("a"), &[selva_core::ROOT_NODE_ID], &[], Timestamp::ZERO).unwrap();
        h.set_hierarchy(id("b"), &[id("a")], &[], Timestamp::ZERO).unwrap();
        h.upsert(id("a"), Timestamp::ZERO).object.set_string("title", "parent", SetMode::Set).unwrap();
        h.upsert(id("b"), Timestamp::ZERO).object.set_string("kind", "child", SetMode::Set).unwrap();
        h
    }

    fn base_opts(anchor: NodeId, traversal: FindTraversal) -> FindOptions {
        FindOptions {
            anchor,
            traversal,
            filter: None,
            order: None,
            limit: None,
            offset: 0,
            fields: None,
            fields_rpn: None,
            excluded_fields: BTreeSet::new(),
            merge: MergeStrategy::None,
            inherit: false,
            now: Timestamp::ZERO,
        }
    }

    #[test]
    fn descendants_find_returns_requested_fields() {
        let mut h = sample();
        let mut indexing = IndexingEngine::new();
        let config = Config::default();
        let mut opts = base_opts(selva_core::ROOT_NODE_ID, FindTraversal::Direction(Direction::BFS_DESCENDANTS));
        opts.fields = Some(vec!["title".to_string(), "kind".to_string()]);
        let rows = find(&mut h, &mut indexing, &config, opts).unwrap();
        assert!(rows.iter().any(|r| r.node == id("a") && r.field == "title"));
        assert!(rows.iter().any(|r| r.node == id("b") && r.field == "kind"));
        assert!(!rows.iter().any(|r| r.node == id("a") && r.field == "kind"));
    }

    #[test]
    fn inherit_resolves_from_nearest_ancestor() {
        let mut h = sample();
        let mut indexing = IndexingEngine::new();
        let config = Config::default();
        let mut opts = base_opts(id("b"), FindTraversal::Direction(Direction::BFS_ANCESTORS));
        opts.fields = Some(vec!["title".to_string()]);
        opts.inherit = true;
        let rows = find(&mut h, &mut indexing, &config, opts).unwrap();
        assert!(rows.iter().any(|r| r.field == "title" && r.value == ObjectValue::String("parent".to_string())));
    }

    #[test]
    fn merge_with_limit_is_rejected() {
        let mut h = sample();
        let mut indexing = IndexingEngine::new();
        let config = Config::default();
        let mut opts = base_opts(selva_core::ROOT_NODE_ID, FindTraversal::Direction(Direction::BFS_DESCENDANTS));
        opts.merge = MergeStrategy::All;
        opts.limit = Some(1);
        assert!(find(&mut h, &mut indexing, &config, opts).is_err());
    }
}
