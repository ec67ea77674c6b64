//! Behaviors
//!
//! A behavior is a registered computation with declared inputs (demands) and
//! outputs (supplies). Each edge set splits into a static part fixed at
//! construction and a dynamic part replaceable at runtime; a replacement is
//! staged on the node and takes effect at the next structural-commit phase
//! of the event loop, never mid-traversal.
//!
//! The node carries the topological bookkeeping: an integer `order` that
//! must exceed the order of every demanded resource's supplier (`0` until
//! first computed), the DFS coloring used by the ordering pass, and the
//! enqueued/last-run sequence stamps that make activation and execution
//! at-most-once per event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;

use crate::graph::error::GraphError;
use crate::graph::extent::ExtentId;
use crate::graph::link::{DemandEdge, DemandLink, ResourceRef};
use crate::graph::resource::ResourceId;
use crate::graph::runtime::{self, Graph, GraphShared};

/// Unique identifier for a behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BehaviorId(u64);

impl BehaviorId {
    /// Generate a new unique behavior ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// DFS coloring used by the ordering pass.
///
/// A behavior reached while still `Ordering` closes a dependency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderingState {
    Ordered,
    Ordering,
    Unordered,
}

/// Graph-side bookkeeping for one behavior.
pub(crate) struct BehaviorNode {
    pub(crate) owner: ExtentId,
    pub(crate) ordering_state: OrderingState,
    pub(crate) order: u64,
    pub(crate) enqueued_sequence: u64,
    pub(crate) last_run_sequence: u64,

    pub(crate) static_demands: IndexSet<DemandEdge>,
    pub(crate) static_supplies: IndexSet<ResourceId>,
    pub(crate) demands: IndexSet<DemandEdge>,
    pub(crate) supplies: IndexSet<ResourceId>,

    pub(crate) uncommitted_dynamic_demands: Option<Vec<DemandEdge>>,
    pub(crate) uncommitted_dynamic_supplies: Option<Vec<ResourceId>>,
    pub(crate) uncommitted_demands: bool,
    pub(crate) uncommitted_supplies: bool,

    pub(crate) on_designated_lane: bool,
    pub(crate) body: Arc<dyn Fn(&Graph) + Send + Sync>,
}

impl BehaviorNode {
    pub(crate) fn new(
        owner: ExtentId,
        static_supplies: IndexSet<ResourceId>,
        static_demands: IndexSet<DemandEdge>,
        on_designated_lane: bool,
        body: Arc<dyn Fn(&Graph) + Send + Sync>,
    ) -> Self {
        Self {
            owner,
            ordering_state: OrderingState::Ordered,
            order: 0,
            enqueued_sequence: 0,
            last_run_sequence: 0,
            uncommitted_supplies: !static_supplies.is_empty(),
            uncommitted_demands: !static_demands.is_empty(),
            static_demands,
            static_supplies,
            demands: IndexSet::new(),
            supplies: IndexSet::new(),
            uncommitted_dynamic_demands: None,
            uncommitted_dynamic_supplies: None,
            on_designated_lane,
            body,
        }
    }
}

/// Handle to a registered behavior.
///
/// Used to replace the dynamic part of its demand or supply set. Both calls
/// are legal only during an event; the replacement is applied at the next
/// structural-commit phase.
pub struct Behavior {
    graph: Weak<GraphShared>,
    id: BehaviorId,
}

impl Behavior {
    pub(crate) fn new(graph: Weak<GraphShared>, id: BehaviorId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> BehaviorId {
        self.id
    }

    /// Replace this behavior's dynamic demands.
    ///
    /// The committed demand set becomes the static demands plus `demands`.
    /// Links against a different graph are rejected through the violation
    /// channel and skipped.
    pub fn set_dynamic_demands(&self, demands: impl IntoIterator<Item = DemandLink>) {
        let Some(shared) = self.graph.upgrade() else {
            return;
        };
        let demands: Vec<DemandLink> = demands.into_iter().collect();
        let id = self.id;
        runtime::with_shared(&shared, |core| {
            if !core.processing_changes() {
                core.raise(GraphError::LinkUpdateOutsideEvent { behavior: id });
                return;
            }
            let mut edges = Vec::with_capacity(demands.len());
            for link in &demands {
                if !link.belongs_to(&shared) {
                    core.raise(GraphError::ForeignResource {
                        resource: link.resource,
                    });
                    continue;
                }
                edges.push(link.edge());
            }
            core.stage_dynamic_demands(id, edges);
        });
    }

    /// Replace this behavior's dynamic supplies.
    ///
    /// The committed supply set becomes the static supplies plus `supplies`.
    /// A supplied resource that already has a different live supplier is a
    /// double-supply violation, raised at commit time.
    pub fn set_dynamic_supplies(&self, supplies: impl IntoIterator<Item = ResourceRef>) {
        let Some(shared) = self.graph.upgrade() else {
            return;
        };
        let supplies: Vec<ResourceRef> = supplies.into_iter().collect();
        let id = self.id;
        runtime::with_shared(&shared, |core| {
            if !core.processing_changes() {
                core.raise(GraphError::LinkUpdateOutsideEvent { behavior: id });
                return;
            }
            let mut resources = Vec::with_capacity(supplies.len());
            for supply in &supplies {
                if !supply.belongs_to(&shared) {
                    core.raise(GraphError::ForeignResource {
                        resource: supply.id,
                    });
                    continue;
                }
                resources.push(supply.id);
            }
            core.stage_dynamic_supplies(id, resources);
        });
    }
}

impl Clone for Behavior {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            id: self.id,
        }
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior").field("id", &self.id).finish()
    }
}
