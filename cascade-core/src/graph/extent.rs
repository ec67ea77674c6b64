//! Extents
//!
//! An extent groups a cohesive set of resources and behaviors created
//! together and added to or removed from the graph as a unit. Its lifecycle
//! is monotonic: `Inactive` until added, `Added` while live, `Removed`
//! afterwards, never reversed. Every extent carries an implicit `added`
//! moment that the graph itself fires once on admission, which is what lets
//! behaviors demand "run when my extent joins the graph".
//!
//! Extents are declared through `ExtentBuilder`: create the resources, chain
//! `behavior()` declarations, then `build()`. Dropping the last handle to a
//! built extent schedules its removal as a new action, so forgetting an
//! extent cannot leave live edges behind.
//!
//! # Dynamic demand and supply resolution
//!
//! A behavior may recompute its demand or supply set from the current values
//! of declared "switch" resources. The builder lowers such a declaration
//! into an implicit ordering moment plus an implicit resolver behavior that
//! demands the switches, computes the new link list (discarding `None`
//! entries), and hands it to the main behavior. `Pre` ordering makes the
//! resolver supply the marker and the main behavior demand it, so resolution
//! lands before the main behavior within the same event; `Post` inverts the
//! marker so resolution follows the main behavior and takes effect at the
//! next event. A resolver that itself needs dynamic links is declared the
//! same way, which nests the construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::graph::behavior::{Behavior, BehaviorId};
use crate::graph::link::{DemandLink, ResourceRef};
use crate::graph::resource::{
    new_state, new_typed_moment, CompareFn, Moment, ResourceId, ResourceKind, State, TypedMoment,
};
use crate::graph::runtime::{self, Graph, GraphShared};

/// Unique identifier for an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtentId(u64);

impl ExtentId {
    /// Generate a new unique extent ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Lifecycle states of an extent. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExtentState {
    Inactive,
    Added,
    Removed,
}

/// Graph-side bookkeeping for one extent.
pub(crate) struct ExtentNode {
    pub(crate) state: ExtentState,
    pub(crate) resources: Vec<ResourceId>,
    pub(crate) behaviors: Vec<BehaviorId>,
    pub(crate) added: ResourceId,
}

struct ExtentInner {
    graph: Weak<GraphShared>,
    id: ExtentId,
    added: Moment,
}

impl Drop for ExtentInner {
    fn drop(&mut self) {
        let Some(shared) = self.graph.upgrade() else {
            return;
        };
        let graph = Graph::from_shared(shared);
        let id = self.id;
        let inner = graph.clone();
        graph.action("extent dropped", move || {
            inner.remove_dropped_extent(id);
        });
    }
}

/// Handle to a declared extent.
///
/// Cheap to clone; the last clone dropping schedules removal from the graph.
#[derive(Clone)]
pub struct Extent {
    inner: Arc<ExtentInner>,
}

impl Extent {
    pub fn id(&self) -> ExtentId {
        self.inner.id
    }

    /// The implicit moment fired once when this extent is added.
    pub fn added(&self) -> Moment {
        self.inner.added.clone()
    }

    /// Add this extent's resources and behaviors to the graph.
    ///
    /// Must be called from within an action.
    pub fn add_to_graph(&self) {
        runtime::with_core(&self.inner.graph, (), |core| {
            core.add_extent(self.inner.id);
        });
    }

    /// Submit a new action whose body adds this extent.
    pub fn add_to_graph_with_action(&self) {
        let Some(shared) = self.inner.graph.upgrade() else {
            return;
        };
        let this = self.clone();
        Graph::from_shared(shared).action("add extent", move || this.add_to_graph());
    }

    /// Remove this extent's resources and behaviors from the graph.
    ///
    /// Must be called from within an event. Behaviors of this extent that
    /// are already scheduled in the current event are skipped rather than
    /// run.
    pub fn remove_from_graph(&self) {
        // The detached nodes drop here, outside the lock scopes: a behavior
        // body may own the last handle to another extent.
        let _removed = runtime::with_core(
            &self.inner.graph,
            runtime::RemovedNodes::default(),
            |core| core.remove_extent(self.inner.id),
        );
    }

    /// Submit a new action whose body removes this extent.
    pub fn remove_from_graph_with_action(&self) {
        let Some(shared) = self.inner.graph.upgrade() else {
            return;
        };
        let this = self.clone();
        Graph::from_shared(shared).action("remove extent", move || this.remove_from_graph());
    }

    /// Queue a side effect on this extent's graph.
    pub fn side_effect(&self, label: &str, body: impl FnOnce() + Send + 'static) {
        let Some(shared) = self.inner.graph.upgrade() else {
            return;
        };
        Graph::from_shared(shared).side_effect(label, body);
    }
}

impl std::fmt::Debug for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extent").field("id", &self.inner.id).finish()
    }
}

/// Whether a dynamic link resolver runs before or after its main behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOrder {
    /// Resolve before the main behavior; new links are visible to the same
    /// event's propagation.
    Pre,
    /// Resolve after the main behavior; new links take effect next event.
    Post,
}

struct DynamicDecl<L> {
    switches: Vec<DemandLink>,
    order: ResolveOrder,
    resolver: Arc<dyn Fn(&Graph) -> Vec<Option<L>> + Send + Sync>,
}

/// Declares the resources and behaviors of one extent.
pub struct ExtentBuilder {
    graph: Graph,
    id: ExtentId,
    added: Moment,
    built: bool,
}

impl ExtentBuilder {
    pub fn new(graph: &Graph) -> Self {
        let (id, added_id) = runtime::create_extent(graph);
        let added = Moment::new(graph.downgrade(), added_id);
        Self {
            graph: graph.clone(),
            id,
            added,
            built: false,
        }
    }

    /// The implicit moment fired once when the built extent is added.
    pub fn added(&self) -> Moment {
        self.added.clone()
    }

    /// Declare a payload-free signal.
    pub fn moment(&mut self) -> Moment {
        let id = runtime::register_resource(&self.graph, self.id, ResourceKind::Moment, None);
        Moment::new(self.graph.downgrade(), id)
    }

    /// Declare a signal carrying a transient payload.
    pub fn typed_moment<T>(&mut self) -> TypedMoment<T>
    where
        T: Clone + Send + 'static,
    {
        let id = ResourceId::next();
        let (moment, transient) = new_typed_moment(self.graph.downgrade(), id);
        runtime::register_resource_with_id(
            &self.graph,
            self.id,
            id,
            ResourceKind::TypedMoment,
            Some(transient),
        );
        moment
    }

    /// Declare a persistent value with no equality policy: every write is a
    /// change.
    pub fn state<T>(&mut self, initial: T) -> State<T>
    where
        T: Clone + Send + 'static,
    {
        self.state_with(initial, None)
    }

    /// Declare a persistent value compared structurally: writes of an equal
    /// value are no-ops.
    pub fn state_eq<T>(&mut self, initial: T) -> State<T>
    where
        T: Clone + Send + PartialEq + 'static,
    {
        self.state_with(initial, Some(Box::new(|a: &T, b: &T| a == b)))
    }

    /// Declare a persistent value with a custom comparator. Identity
    /// comparison is a comparator over `Arc::ptr_eq` or similar.
    pub fn state_cmp<T>(
        &mut self,
        initial: T,
        compare: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> State<T>
    where
        T: Clone + Send + 'static,
    {
        self.state_with(initial, Some(Box::new(compare)))
    }

    fn state_with<T>(&mut self, initial: T, compare: Option<CompareFn<T>>) -> State<T>
    where
        T: Clone + Send + 'static,
    {
        let id = ResourceId::next();
        let (state, transient) = new_state(self.graph.downgrade(), id, initial, compare);
        runtime::register_resource_with_id(
            &self.graph,
            self.id,
            id,
            ResourceKind::State,
            Some(transient),
        );
        state
    }

    /// Begin declaring a behavior of this extent.
    pub fn behavior(&mut self) -> BehaviorBuilder<'_> {
        BehaviorBuilder {
            builder: self,
            supplies: Vec::new(),
            demands: Vec::new(),
            dynamic_demands: None,
            dynamic_supplies: None,
            on_designated_lane: false,
        }
    }

    /// Finish the declaration and produce the extent handle.
    pub fn build(mut self) -> Extent {
        self.built = true;
        Extent {
            inner: Arc::new(ExtentInner {
                graph: self.graph.downgrade(),
                id: self.id,
                added: self.added.clone(),
            }),
        }
    }

    fn register_behavior(
        &mut self,
        supplies: Vec<ResourceRef>,
        demands: Vec<DemandLink>,
        on_designated_lane: bool,
        body: Arc<dyn Fn(&Graph) + Send + Sync>,
    ) -> Behavior {
        let id = runtime::register_behavior(
            &self.graph,
            self.id,
            supplies,
            demands,
            on_designated_lane,
            body,
        );
        Behavior::new(self.graph.downgrade(), id)
    }
}

impl Drop for ExtentBuilder {
    fn drop(&mut self) {
        // An abandoned declaration leaves no nodes behind.
        if !self.built {
            runtime::purge_extent(&self.graph, self.id);
        }
    }
}

/// Declares one behavior: its supplies, demands, optional dynamic resolvers,
/// and body.
pub struct BehaviorBuilder<'a> {
    builder: &'a mut ExtentBuilder,
    supplies: Vec<ResourceRef>,
    demands: Vec<DemandLink>,
    dynamic_demands: Option<DynamicDecl<DemandLink>>,
    dynamic_supplies: Option<DynamicDecl<ResourceRef>>,
    on_designated_lane: bool,
}

impl BehaviorBuilder<'_> {
    /// Resources this behavior writes. A resource may be supplied by at most
    /// one live behavior.
    pub fn supplies(mut self, supplies: impl IntoIterator<Item = ResourceRef>) -> Self {
        self.supplies.extend(supplies);
        self
    }

    /// Resources this behavior reads. Reactive links activate the behavior
    /// when the resource updates; order-only links sequence without
    /// activating.
    pub fn demands(mut self, demands: impl IntoIterator<Item = DemandLink>) -> Self {
        self.demands.extend(demands);
        self
    }

    /// Recompute this behavior's demands from the given switch resources.
    ///
    /// `None` entries in the resolver's result are discarded.
    pub fn dynamic_demands(
        mut self,
        switches: impl IntoIterator<Item = DemandLink>,
        order: ResolveOrder,
        resolver: impl Fn(&Graph) -> Vec<Option<DemandLink>> + Send + Sync + 'static,
    ) -> Self {
        self.dynamic_demands = Some(DynamicDecl {
            switches: switches.into_iter().collect(),
            order,
            resolver: Arc::new(resolver),
        });
        self
    }

    /// Recompute this behavior's supplies from the given switch resources.
    pub fn dynamic_supplies(
        mut self,
        switches: impl IntoIterator<Item = DemandLink>,
        order: ResolveOrder,
        resolver: impl Fn(&Graph) -> Vec<Option<ResourceRef>> + Send + Sync + 'static,
    ) -> Self {
        self.dynamic_supplies = Some(DynamicDecl {
            switches: switches.into_iter().collect(),
            order,
            resolver: Arc::new(resolver),
        });
        self
    }

    /// Route this behavior's execution to the graph's designated lane.
    /// Lane behaviors run at the end of a drain round.
    pub fn on_designated_lane(mut self) -> Self {
        self.on_designated_lane = true;
        self
    }

    /// Register the behavior with the given body and return its handle.
    pub fn runs(self, body: impl Fn(&Graph) + Send + Sync + 'static) -> Behavior {
        let BehaviorBuilder {
            builder,
            supplies,
            demands,
            dynamic_demands,
            dynamic_supplies,
            on_designated_lane,
        } = self;

        let mut extended_supplies = supplies;
        let mut extended_demands = demands;

        let supplies_marker = match &dynamic_supplies {
            Some(decl) if !decl.switches.is_empty() => {
                let marker = builder.moment();
                match decl.order {
                    ResolveOrder::Pre => extended_demands.push(marker.link()),
                    ResolveOrder::Post => extended_supplies.push(marker.resource()),
                }
                Some(marker)
            }
            _ => None,
        };

        let demands_marker = match &dynamic_demands {
            Some(decl) if !decl.switches.is_empty() => {
                let marker = builder.moment();
                match decl.order {
                    ResolveOrder::Pre => extended_demands.push(marker.link()),
                    ResolveOrder::Post => extended_supplies.push(marker.resource()),
                }
                Some(marker)
            }
            _ => None,
        };

        let main = builder.register_behavior(
            extended_supplies.clone(),
            extended_demands.clone(),
            on_designated_lane,
            Arc::new(body),
        );

        if let (Some(decl), Some(marker)) = (dynamic_supplies, supplies_marker) {
            let mut implicit_supplies = Vec::new();
            let mut implicit_demands = decl.switches;
            match decl.order {
                ResolveOrder::Pre => implicit_supplies.push(marker.resource()),
                ResolveOrder::Post => implicit_demands.push(marker.link()),
            }
            let resolver = decl.resolver;
            let target = main.clone();
            let base = extended_supplies.clone();
            builder.register_behavior(
                implicit_supplies,
                implicit_demands,
                false,
                Arc::new(move |graph: &Graph| {
                    let mut supplies = base.clone();
                    supplies.extend(resolver(graph).into_iter().flatten());
                    target.set_dynamic_supplies(supplies);
                }),
            );
        }

        if let (Some(decl), Some(marker)) = (dynamic_demands, demands_marker) {
            let mut implicit_supplies = Vec::new();
            let mut implicit_demands = decl.switches;
            match decl.order {
                ResolveOrder::Pre => implicit_supplies.push(marker.resource()),
                ResolveOrder::Post => implicit_demands.push(marker.link()),
            }
            let resolver = decl.resolver;
            let target = main.clone();
            let base = extended_demands.clone();
            builder.register_behavior(
                implicit_supplies,
                implicit_demands,
                false,
                Arc::new(move |graph: &Graph| {
                    let mut demands = base.clone();
                    demands.extend(resolver(graph).into_iter().flatten());
                    target.set_dynamic_demands(demands);
                }),
            );
        }

        main
    }
}
