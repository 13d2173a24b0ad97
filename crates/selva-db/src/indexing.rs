//! Auto-indexing engine (§4.5): ICB popularity tracking, the bounded
//! `top_indices` ("poptop") promotion list, and materialization of an ICB
//! as a subscription marker that the ordinary event-deferral machinery
//! keeps fresh.

use std::collections::BTreeMap;

use base64::Engine as _;
use selva_core::{NodeId, Timestamp};
use selva_rpn::Expr;

use crate::config::Config;
use crate::error::DbResult;
use crate::hierarchy::Hierarchy;
use crate::subscription::{
    AnchorDescriptor, EventFlags, MarkerRegistry, SubId, SubscriptionMarker, subscription_id_from_seed,
};
use crate::traversal::{self, CollectVisitor, Direction, HierarchyEvalContext};

pub type IcbId = u64;

/// The traversal direction an ICB indexes. Only the three directions the
/// spec lists as "the allowed set" are indexable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDirection {
    BfsAncestors,
    BfsDescendants,
    BfsExpression,
}

/// An Index Control Block: the popularity/materialization state for one
/// `(anchor, direction, order, filter)` query signature.
#[derive(Debug, Clone)]
pub struct Icb {
    pub id: IcbId,
    pub name: String,
    pub anchor: NodeId,
    pub dir: IndexDirection,
    pub dir_expr: Option<Expr>,
    pub order_field: Option<String>,
    pub order_desc: bool,
    pub filter: Option<Expr>,
    pub permanent: bool,
    pub active: bool,
    marker_id: Option<u32>,
    valid: bool,
    pop_count_cur: u64,
    pop_ave: f64,
    size_ave: f64,
    created_at: Timestamp,
}

impl Icb {
    fn sub_id(&self) -> SubId {
        icb_sub_id(self.id)
    }
}

fn icb_sub_id(id: IcbId) -> SubId {
    subscription_id_from_seed(&id.to_le_bytes())
}

/// Deterministic ICB name: `id || '.' || dirLetter [...] `, a pure
/// function of the query signature so lookup is a name comparison.
pub fn icb_name(
    anchor: NodeId,
    dir: IndexDirection,
    dir_expr: Option<&Expr>,
    order_field: Option<(&str, bool)>,
    filter: Option<&Expr>,
) -> String {
    let b64 = base64::engine::general_purpose::STANDARD;
    let mut name = anchor.to_string();
    name.push('.');
    name.push(match dir {
        IndexDirection::BfsAncestors => 'a',
        IndexDirection::BfsDescendants => 'd',
        IndexDirection::BfsExpression => 'e',
    });
    if let Some(expr) = dir_expr {
        name.push('.');
        name.push_str(&b64.encode(format!("{expr:?}")));
    }
    if let Some((field, desc)) = order_field {
        name.push('.');
        name.push(if desc { 'D' } else { 'A' });
        name.push('.');
        name.push_str(&b64.encode(field));
    }
    if let Some(filter) = filter {
        name.push('.');
        name.push_str(&b64.encode(format!("{filter:?}")));
    }
    name
}

#[derive(Debug, Default)]
pub struct IndexingEngine {
    icbs: BTreeMap<IcbId, Icb>,
    by_name: BTreeMap<String, IcbId>,
    next_id: IcbId,
    last_icb_tick: Option<Timestamp>,
    last_top_tick: Option<Timestamp>,
}

impl IndexingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: IcbId) -> Option<&Icb> {
        self.icbs.get(&id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Icb> {
        self.icbs.values()
    }

    /// "Upsert on query": look the ICB up by its deterministic name,
    /// bumping its popularity counter, or create one with an initial
    /// count that keeps it a candidate without materializing it.
    #[allow(clippy::too_many_arguments)]
    pub fn touch(
        &mut self,
        anchor: NodeId,
        dir: IndexDirection,
        dir_expr: Option<Expr>,
        order_field: Option<(String, bool)>,
        filter: Option<Expr>,
        now: Timestamp,
    ) -> IcbId {
        let name = icb_name(
            anchor,
            dir,
            dir_expr.as_ref(),
            order_field.as_ref().map(|(f, d)| (f.as_str(), *d)),
            filter.as_ref(),
        );
        if let Some(&id) = self.by_name.get(&name) {
            self.icbs.get_mut(&id).expect("by_name in sync").pop_count_cur += 1;
            return id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.icbs.insert(
            id,
            Icb {
                id,
                name: name.clone(),
                anchor,
                dir,
                dir_expr,
                order_field: order_field.as_ref().map(|(f, _)| f.clone()),
                order_desc: order_field.map(|(_, d)| d).unwrap_or(false),
                filter,
                permanent: false,
                active: false,
                marker_id: None,
                valid: false,
                pop_count_cur: 1,
                pop_ave: 0.0,
                size_ave: 0.0,
                created_at: now,
            },
        );
        self.by_name.insert(name, id);
        id
    }

    /// Creates a permanent (user-requested, `index.new`) ICB; it counts
    /// against the `find_indices_max` budget but its score is boosted so
    /// it resists eviction.
    #[allow(clippy::too_many_arguments)]
    pub fn create_permanent(
        &mut self,
        h: &mut Hierarchy,
        markers: &mut MarkerRegistry,
        anchor: NodeId,
        dir: IndexDirection,
        dir_expr: Option<Expr>,
        order_field: Option<(String, bool)>,
        filter: Option<Expr>,
        now: Timestamp,
    ) -> DbResult<IcbId> {
        let id = self.touch(anchor, dir, dir_expr, order_field, filter, now);
        self.icbs.get_mut(&id).expect("just touched").permanent = true;
        self.materialize(h, markers, id)?;
        Ok(id)
    }

    pub fn destroy(&mut self, h: &mut Hierarchy, markers: &mut MarkerRegistry, id: IcbId) -> DbResult<()> {
        if let Some(icb) = self.icbs.get(&id) {
            if icb.active {
                let _ = markers.delete_subscription(h, icb.sub_id());
            }
            self.by_name.remove(&icb.name);
        }
        self.icbs.remove(&id);
        Ok(())
    }

    /// Drops the materialized index but keeps the ICB (and its
    /// popularity history) around as a candidate.
    pub fn discard_index(&mut self, h: &mut Hierarchy, markers: &mut MarkerRegistry, id: IcbId) -> DbResult<()> {
        if let Some(icb) = self.icbs.get_mut(&id) {
            if icb.active {
                markers.delete_subscription(h, icb.sub_id())?;
                icb.active = false;
                icb.marker_id = None;
                icb.valid = false;
            }
        }
        Ok(())
    }

    fn materialize(&mut self, h: &mut Hierarchy, markers: &mut MarkerRegistry, id: IcbId) -> DbResult<()> {
        let icb = self.icbs.get(&id).expect("icb exists").clone();
        let anchor_descriptor = match icb.dir {
            IndexDirection::BfsAncestors => AnchorDescriptor::Direction(Direction::BFS_ANCESTORS),
            IndexDirection::BfsDescendants => AnchorDescriptor::Direction(Direction::BFS_DESCENDANTS),
            IndexDirection::BfsExpression => AnchorDescriptor::Expression {
                field_expr: icb.dir_expr.clone().expect("expression ICB has an expr"),
                edge_filter: None,
            },
        };
        let marker_id = markers.next_marker_id();
        markers.add_marker(
            h,
            SubscriptionMarker {
                id: marker_id,
                sub_id: icb.sub_id(),
                flags: EventFlags::CH_HIERARCHY | EventFlags::CH_FIELD | EventFlags::REFRESH,
                anchor_node: icb.anchor,
                anchor: anchor_descriptor,
                field_filter: Default::default(),
                filter_expr: icb.filter.clone(),
                owner: crate::subscription::MarkerOwner::Indexer(id),
                trigger: None,
                detached: false,
            },
        )?;
        let icb = self.icbs.get_mut(&id).expect("icb exists");
        icb.marker_id = Some(marker_id);
        icb.active = true;
        icb.valid = true;
        Ok(())
    }

    /// The materialized node set, read from marker membership (the
    /// "cached result").
    pub fn materialized_nodes(&self, h: &Hierarchy, id: IcbId) -> Vec<NodeId> {
        let Some(icb) = self.icbs.get(&id) else { return Vec::new() };
        let Some(marker_id) = icb.marker_id else { return Vec::new() };
        h.node_ids_snapshot().into_iter().filter(|n| h.find_node(*n).is_some_and(|node| node.markers.contains(&marker_id))).collect()
    }

    fn measure(&self, h: &mut Hierarchy, icb: &Icb) -> DbResult<usize> {
        let mut collector = CollectVisitor::default();
        match icb.dir {
            IndexDirection::BfsAncestors => traversal::bfs(h, icb.anchor, true, &mut collector)?,
            IndexDirection::BfsDescendants => traversal::bfs(h, icb.anchor, false, &mut collector)?,
            IndexDirection::BfsExpression => {
                let expr = icb.dir_expr.as_ref().expect("expression ICB has an expr");
                traversal::expression_traversal(h, icb.anchor, expr, None, &mut collector)?;
            }
        }
        if icb.filter.is_none() {
            return Ok(collector.nodes.len());
        }
        let filter = icb.filter.as_ref().unwrap();
        let mut count = 0;
        for node in collector.nodes {
            let ctx = HierarchyEvalContext { hierarchy: h, current: node };
            if selva_rpn::eval_bool(Some(filter), &ctx)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Per-ICB stats update (`icb_proc`, §4.5): advances the popularity
    /// and size low-pass averages and resets the query counter.
    pub fn icb_tick(&mut self, h: &mut Hierarchy, config: &Config, now: Timestamp) -> DbResult<()> {
        if let Some(last) = self.last_icb_tick {
            if now.0 - last.0 < config.find_indexing_icb_update_interval.as_millis() as i64 {
                return Ok(());
            }
        }
        self.last_icb_tick = Some(now);

        let period = config.find_indexing_popularity_ave_period.as_millis().max(1) as f64;
        let interval = config.find_indexing_icb_update_interval.as_millis().max(1) as f64;
        let alpha = (interval / period).min(1.0);

        let ids: Vec<IcbId> = self.icbs.keys().copied().collect();
        for id in ids {
            let icb = self.icbs.get(&id).expect("exists").clone();
            let size = self.measure(h, &icb)? as f64;
            let icb = self.icbs.get_mut(&id).expect("exists");
            icb.pop_ave += (icb.pop_count_cur as f64 - icb.pop_ave) * alpha;
            icb.pop_count_cur = 0;
            icb.size_ave += (size - icb.size_ave) * alpha;
        }
        Ok(())
    }

    /// `top_indices` decision pass (§4.5 step 2-3): promote/evict based on
    /// the median-cut `poptop` window.
    pub fn top_indices_tick(&mut self, h: &mut Hierarchy, markers: &mut MarkerRegistry, config: &Config, now: Timestamp) -> DbResult<()> {
        if let Some(last) = self.last_top_tick {
            if now.0 - last.0 < config.find_indexing_interval.as_millis() as i64 {
                return Ok(());
            }
        }
        self.last_top_tick = Some(now);

        if !config.indexing_enabled() {
            for id in self.icbs.keys().copied().collect::<Vec<_>>() {
                self.discard_index(h, markers, id)?;
            }
            return Ok(());
        }

        let threshold = config.find_indexing_threshold as f64;
        let mut candidates: Vec<(IcbId, f64)> = self
            .icbs
            .values()
            .filter(|icb| icb.size_ave >= threshold)
            .map(|icb| {
                let boost = if icb.permanent { 1e9 } else { 1.0 };
                (icb.id, icb.pop_ave * icb.size_ave * boost)
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        let window_len = (2 * config.find_indices_max).min(candidates.len());
        candidates.truncate(window_len);

        if candidates.is_empty() {
            return Ok(());
        }
        let mut scores: Vec<f64> = candidates.iter().map(|(_, s)| *s).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        let cut_limit = scores[scores.len() / 2];

        let low_pop_threshold = 1.0;
        for &(id, score) in &candidates {
            if score < cut_limit {
                let icb = self.icbs.get(&id).expect("exists");
                if icb.active {
                    if icb.pop_ave >= low_pop_threshold {
                        self.discard_index(h, markers, id)?;
                    } else {
                        self.destroy(h, markers, id)?;
                    }
                }
            }
        }

        let mut active_count = self.icbs.values().filter(|icb| icb.active).count();
        for &(id, score) in &candidates {
            if active_count >= config.find_indices_max {
                break;
            }
            if score < cut_limit {
                continue;
            }
            let already_active = self.icbs.get(&id).is_some_and(|icb| icb.active);
            if !already_active {
                self.materialize(h, markers, id)?;
                active_count += 1;
            }
        }
        Ok(())
    }

    pub fn tick(&mut self, h: &mut Hierarchy, markers: &mut MarkerRegistry, config: &Config, now: Timestamp) -> DbResult<()> {
        self.icb_tick(h, config, now)?;
        self.top_indices_tick(h, markers, config, now)?;
        Ok(())
    }

    /// Whether `sub_id` is one of this engine's synthetic per-ICB
    /// subscription ids (used to route deferred events internally
    /// instead of handing them to a client).
    pub fn owns(&self, sub_id: SubId) -> bool {
        self.icbs.values().any(|icb| icb.sub_id() == sub_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_pure_function_of_signature() {
        let a = icb_name("root".parse().unwrap(), IndexDirection::BfsDescendants, None, None, None);
        let b = icb_name("root".parse().unwrap(), IndexDirection::BfsDescendants, None, None, None);
        assert_eq!(a, b);
        let c = icb_name("root".parse().unwrap(), IndexDirection::BfsAncestors, None, None, None);
        assert_ne!(a, c);
    }

    #[test]
    fn touch_reuses_existing_icb_by_name() {
        let mut engine = IndexingEngine::new();
        let id1 = engine.touch("root".parse().unwrap(), IndexDirection::BfsDescendants, None, None, None, Timestamp::ZERO);
        let id2 = engine.touch("root".parse().unwrap(), IndexDirection::BfsDescendants, None, None, None, Timestamp::ZERO);
        assert_eq!(id1, id2);
        assert_eq!(engine.get(id1).unwrap().pop_count_cur, 2);
    }

    #[test]
    fn zero_budget_discards_all_indices() {
        let mut h = Hierarchy::new();
        let mut markers = MarkerRegistry::new();
        let mut engine = IndexingEngine::new();
        let id = engine
            .create_permanent(&mut h, &mut markers, selva_core::ROOT_NODE_ID, IndexDirection::BfsDescendants, None, None, None, Timestamp::ZERO)
            .unwrap();
        assert!(engine.get(id).unwrap().active);
        let config = Config { find_indices_max: 0, ..Config::default() };
        engine.top_indices_tick(&mut h, &mut markers, &config, Timestamp(1)).unwrap();
        assert!(!engine.get(id).unwrap().active);
    }
}
