//! The in-process hierarchical graph store: node index, edge fields,
//! traversal, subscriptions, auto-indexing, and the modify operation.
//!
//! This crate is the core engine only (§5 "single writer, no network
//! surface"); the command-dispatch/wire-protocol collaborator lives in
//! `selva-cli`.

mod config;
mod edge;
mod error;
mod eventbus;
mod find;
mod hierarchy;
mod indexing;
mod modify;
mod node;
mod object;
mod subscription;
mod traversal;

pub use config::Config;
pub use edge::{ConstraintFlags, EdgeField, EdgeFieldConstraint, EdgeFieldContainer};
pub use error::{DbError, DbResult};
pub use eventbus::{EventBus, EventReceiver};
pub use find::{FindOptions, FindResultItem, FindTraversal, MergeStrategy};
pub use hierarchy::{DeleteFlags, Hierarchy};
pub use indexing::{Icb, IcbId, IndexDirection, IndexingEngine};
pub use modify::{ModifyFlags, ModifyOp, ModifyOutcome, ModifyTriplet, modify, replication_message};
pub use node::Node;
pub use object::{Object, ObjectEntry, ObjectValue, SetMember, SetMode, SetValue};
pub use subscription::{
    AnchorDescriptor, DeferredEvent, DeferredEventQueue, EventFlags, EventKind, MarkerOwner,
    MarkerRegistry, SubId, SubscriptionMarker, TriggerKind, subscription_id_from_seed,
};
pub use traversal::{CollectVisitor, Direction, TraversalVisitor};

use selva_core::Timestamp;
use tracing::instrument;

/// The top-level aggregate: the hierarchy store plus the subscription and
/// auto-indexing state layered on top of it. A single `Db` corresponds to
/// one in-memory graph; the core is single-threaded per §5, so every
/// method here takes `&mut self`.
#[derive(Debug, Default)]
pub struct Db {
    hierarchy: Hierarchy,
    markers: MarkerRegistry,
    events: DeferredEventQueue,
    indexing: IndexingEngine,
    config: Config,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn hierarchy_mut(&mut self) -> &mut Hierarchy {
        &mut self.hierarchy
    }

    pub fn markers(&self) -> &MarkerRegistry {
        &self.markers
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Executes a modify operation (§4.6), running the 3-phase
    /// precheck/apply/defer pipeline and enqueueing whatever deferred
    /// subscription events the mutation produced.
    #[instrument(skip(self, triplets))]
    pub fn modify(
        &mut self,
        node: selva_core::NodeId,
        flags: ModifyFlags,
        triplets: Vec<ModifyTriplet>,
        now: Timestamp,
    ) -> DbResult<Vec<ModifyOutcome>> {
        modify::modify(&mut self.hierarchy, &mut self.markers, &mut self.events, node, flags, triplets, now)
    }

    /// Registers a new subscription marker and refreshes its membership
    /// immediately (§4.4).
    pub fn subscribe(&mut self, marker: SubscriptionMarker) -> DbResult<()> {
        self.markers.add_marker(&mut self.hierarchy, marker)
    }

    pub fn unsubscribe(&mut self, sub_id: SubId) -> DbResult<()> {
        self.markers.delete_subscription(&mut self.hierarchy, sub_id)
    }

    /// Drains and returns every deferred event produced since the last
    /// flush, one per `(subscription, node, event-kind)` tuple (P9).
    /// Events on the auto-indexer's own synthetic subscriptions are
    /// dropped here: the indexer reads ICB freshness straight off marker
    /// membership rather than consuming its own deferred events.
    pub fn flush_events(&mut self) -> Vec<DeferredEvent> {
        self.events.flush().into_iter().filter(|e| !self.indexing.owns(e.sub_id)).collect()
    }

    /// Runs one tick of the auto-indexing engine (§4.5): advance
    /// popularity decay, (de)materialize ICBs past the eligibility
    /// threshold, and refresh existing ICB markers.
    pub fn index_tick(&mut self, now: Timestamp) -> DbResult<()> {
        self.indexing.tick(&mut self.hierarchy, &mut self.markers, &self.config, now)
    }

    pub fn find(&mut self, opts: FindOptions) -> DbResult<Vec<FindResultItem>> {
        find::find(&mut self.hierarchy, &mut self.indexing, &self.config, opts)
    }

    /// `index.list` (§6): every known ICB, materialized or not.
    pub fn index_list(&self) -> impl Iterator<Item = &Icb> {
        self.indexing.list()
    }

    /// `index.new` (§6): creates (or reuses, if an identical one already
    /// exists) a permanent ICB and materializes it immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn index_new(
        &mut self,
        anchor: selva_core::NodeId,
        dir: IndexDirection,
        dir_expr: Option<selva_rpn::Expr>,
        order_field: Option<(String, bool)>,
        filter: Option<selva_rpn::Expr>,
        now: Timestamp,
    ) -> DbResult<IcbId> {
        self.indexing.create_permanent(&mut self.hierarchy, &mut self.markers, anchor, dir, dir_expr, order_field, filter, now)
    }

    /// `index.del` (§6): drops an ICB's marker (`discard_only`) or removes
    /// the ICB entirely.
    pub fn index_del(&mut self, id: IcbId, discard_only: bool) -> DbResult<()> {
        if discard_only {
            self.indexing.discard_index(&mut self.hierarchy, &mut self.markers, id)
        } else {
            self.indexing.destroy(&mut self.hierarchy, &mut self.markers, id)
        }
    }
}
