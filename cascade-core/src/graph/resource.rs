//! Resources
//!
//! A resource is a reactive cell: it remembers the event at which it last
//! changed, knows the one behavior allowed to supply it, and keeps the set of
//! subsequent behaviors to notify when it does change. Three variants exist:
//!
//! - `Moment`: a payload-free signal; only the event stamp matters.
//! - `TypedMoment<T>`: a signal carrying a transient payload, cleared when
//!   the event completes so it cannot leak into the next one.
//! - `State<T>`: a persistent value with an equality policy deciding whether
//!   a write is a no-op, plus a trace of the previous value readable
//!   mid-event.
//!
//! # Storage split
//!
//! Bookkeeping (event stamps, supplier, subsequents, owning extent) lives in
//! a `ResourceNode` inside the graph's arena, addressed by `ResourceId`.
//! Payloads live in cells owned by the typed handles and shared with the
//! graph only through the transient-clearing hook. A handle holds a weak
//! reference to its graph: once the graph is gone or the owning extent has
//! been removed, updates become inert no-ops while the last payload remains
//! readable.
//!
//! All mutation legality (inside an event, correct supplier, once per event)
//! is checked by the runtime before a cell is touched; see the runtime
//! module.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::graph::behavior::BehaviorId;
use crate::graph::event::Event;
use crate::graph::extent::ExtentId;
use crate::graph::link::{DemandLink, ResourceRef, SubsequentEdge};
use crate::graph::runtime::{self, Graph, GraphShared};

/// Unique identifier for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Generate a new unique resource ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Which variant a resource node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    Moment,
    TypedMoment,
    State,
}

/// Payload cells that must be swept when the event completes.
///
/// `clear` returns the removed payload boxed, so the runtime can drop it
/// after the sweep has finished iterating. A payload drop may run arbitrary
/// user code (for example an extent handle whose drop schedules a removal
/// action), which must not happen while a queue is being walked.
pub(crate) trait TransientCell: Send + Sync {
    fn clear(&self) -> Option<Box<dyn Any + Send>>;
}

/// Graph-side bookkeeping for one resource.
pub(crate) struct ResourceNode {
    pub(crate) owner: ExtentId,
    pub(crate) last_event: Event,
    pub(crate) prev_event: Event,
    pub(crate) supplier: Option<BehaviorId>,
    pub(crate) subsequents: IndexSet<SubsequentEdge>,
    pub(crate) transient: Option<Arc<dyn TransientCell>>,
}

impl ResourceNode {
    pub(crate) fn new(owner: ExtentId, transient: Option<Arc<dyn TransientCell>>) -> Self {
        Self {
            owner,
            last_event: Event::unknown_past(),
            prev_event: Event::unknown_past(),
            supplier: None,
            subsequents: IndexSet::new(),
            transient,
        }
    }
}

// ----------------------------------------------------------------------------
// Moment
// ----------------------------------------------------------------------------

/// A payload-free signal resource.
pub struct Moment {
    graph: Weak<GraphShared>,
    id: ResourceId,
}

impl Moment {
    pub(crate) fn new(graph: Weak<GraphShared>, id: ResourceId) -> Self {
        Self { graph, id }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// An untyped reference for supply declarations.
    pub fn resource(&self) -> ResourceRef {
        ResourceRef {
            graph: self.graph.clone(),
            id: self.id,
        }
    }

    /// A reactive demand on this resource.
    pub fn link(&self) -> DemandLink {
        self.resource().link()
    }

    /// An order-only demand on this resource.
    pub fn order(&self) -> DemandLink {
        self.resource().order()
    }

    /// Signal this moment for the current event.
    pub fn update(&self) {
        runtime::update_resource(&self.graph, self.id, false, |_event| true);
    }

    /// Submit a new action whose body signals this moment.
    pub fn update_with_action(&self, cause: &str) {
        let Some(shared) = self.graph.upgrade() else {
            return;
        };
        let this = self.clone();
        Graph::from_shared(shared).action(cause, move || this.update());
    }

    /// The event at which this moment last fired.
    pub fn event(&self) -> Event {
        runtime::with_core(&self.graph, Event::unknown_past(), |core| {
            core.verify_demand(self.id);
            core.resource_event(self.id)
        })
    }

    /// The event before the current one, readable mid-event.
    pub fn trace_event(&self) -> Event {
        runtime::with_core(&self.graph, Event::unknown_past(), |core| {
            core.resource_trace_event(self.id)
        })
    }

    /// True while inspected within the event that updated this moment.
    pub fn just_updated(&self) -> bool {
        runtime::with_core(&self.graph, false, |core| {
            core.verify_demand(self.id);
            core.resource_just_updated(self.id)
        })
    }

    /// True once this moment has fired at least once.
    pub fn has_updated(&self) -> bool {
        self.event().sequence() > 0
    }
}

impl Clone for Moment {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            id: self.id,
        }
    }
}

impl std::fmt::Debug for Moment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Moment").field("id", &self.id).finish()
    }
}

// ----------------------------------------------------------------------------
// TypedMoment
// ----------------------------------------------------------------------------

struct TypedMomentCell<T> {
    value: Mutex<Option<T>>,
}

impl<T: Send + 'static> TransientCell for TypedMomentCell<T> {
    fn clear(&self) -> Option<Box<dyn Any + Send>> {
        self.value
            .lock()
            .take()
            .map(|value| Box::new(value) as Box<dyn Any + Send>)
    }
}

/// A signal resource carrying a transient payload.
///
/// The payload is available only for the remainder of the event in which it
/// was updated; the runtime clears it before going idle.
pub struct TypedMoment<T>
where
    T: Clone + Send + 'static,
{
    graph: Weak<GraphShared>,
    id: ResourceId,
    cell: Arc<TypedMomentCell<T>>,
}

pub(crate) fn new_typed_moment<T>(
    graph: Weak<GraphShared>,
    id: ResourceId,
) -> (TypedMoment<T>, Arc<dyn TransientCell>)
where
    T: Clone + Send + 'static,
{
    let cell = Arc::new(TypedMomentCell {
        value: Mutex::new(None),
    });
    let transient: Arc<dyn TransientCell> = Arc::clone(&cell) as Arc<dyn TransientCell>;
    (TypedMoment { graph, id, cell }, transient)
}

impl<T> TypedMoment<T>
where
    T: Clone + Send + 'static,
{
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef {
            graph: self.graph.clone(),
            id: self.id,
        }
    }

    pub fn link(&self) -> DemandLink {
        self.resource().link()
    }

    pub fn order(&self) -> DemandLink {
        self.resource().order()
    }

    /// Signal this moment with a payload for the current event.
    pub fn update(&self, value: T) {
        let cell = Arc::clone(&self.cell);
        runtime::update_resource(&self.graph, self.id, true, move |_event| {
            *cell.value.lock() = Some(value);
            true
        });
    }

    /// Submit a new action whose body signals this moment.
    pub fn update_with_action(&self, value: T, cause: &str) {
        let Some(shared) = self.graph.upgrade() else {
            return;
        };
        let this = self.clone();
        Graph::from_shared(shared).action(cause, move || this.update(value));
    }

    /// The payload supplied during the current event, if any.
    pub fn updated_value(&self) -> Option<T> {
        runtime::with_core(&self.graph, (), |core| core.verify_demand(self.id));
        self.cell.value.lock().clone()
    }

    pub fn event(&self) -> Event {
        runtime::with_core(&self.graph, Event::unknown_past(), |core| {
            core.verify_demand(self.id);
            core.resource_event(self.id)
        })
    }

    pub fn trace_event(&self) -> Event {
        runtime::with_core(&self.graph, Event::unknown_past(), |core| {
            core.resource_trace_event(self.id)
        })
    }

    pub fn just_updated(&self) -> bool {
        runtime::with_core(&self.graph, false, |core| {
            core.verify_demand(self.id);
            core.resource_just_updated(self.id)
        })
    }

    pub fn has_updated(&self) -> bool {
        self.event().sequence() > 0
    }
}

impl<T> Clone for TypedMoment<T>
where
    T: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for TypedMoment<T>
where
    T: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedMoment").field("id", &self.id).finish()
    }
}

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

pub(crate) type CompareFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct StateInner<T> {
    value: T,
    prev: Option<T>,
}

struct StateCell<T> {
    inner: Mutex<StateInner<T>>,
    compare: Option<CompareFn<T>>,
}

impl<T: Send + 'static> TransientCell for StateCell<T> {
    fn clear(&self) -> Option<Box<dyn Any + Send>> {
        self.inner
            .lock()
            .prev
            .take()
            .map(|value| Box::new(value) as Box<dyn Any + Send>)
    }
}

/// A persistent value resource with an equality policy.
///
/// The policy decides whether a write carrying an equal value is a silent
/// no-op: `None` treats every write as a change, a comparator judges old
/// against new. Identity comparison is a comparator over `Arc::ptr_eq` or
/// similar.
pub struct State<T>
where
    T: Clone + Send + 'static,
{
    graph: Weak<GraphShared>,
    id: ResourceId,
    cell: Arc<StateCell<T>>,
}

pub(crate) fn new_state<T>(
    graph: Weak<GraphShared>,
    id: ResourceId,
    initial: T,
    compare: Option<CompareFn<T>>,
) -> (State<T>, Arc<dyn TransientCell>)
where
    T: Clone + Send + 'static,
{
    let cell = Arc::new(StateCell {
        inner: Mutex::new(StateInner {
            prev: Some(initial.clone()),
            value: initial,
        }),
        compare,
    });
    let transient: Arc<dyn TransientCell> = Arc::clone(&cell) as Arc<dyn TransientCell>;
    (State { graph, id, cell }, transient)
}

impl<T> State<T>
where
    T: Clone + Send + 'static,
{
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef {
            graph: self.graph.clone(),
            id: self.id,
        }
    }

    pub fn link(&self) -> DemandLink {
        self.resource().link()
    }

    pub fn order(&self) -> DemandLink {
        self.resource().order()
    }

    /// Write a new value for the current event.
    ///
    /// If the equality policy judges the new value equal to the current one,
    /// the write is a silent no-op and subsequents are not activated.
    pub fn update(&self, value: T) {
        let cell = Arc::clone(&self.cell);
        runtime::update_resource(&self.graph, self.id, true, move |_event| {
            let mut inner = cell.inner.lock();
            if let Some(compare) = &cell.compare {
                if compare(&inner.value, &value) {
                    return false;
                }
            }
            inner.prev = Some(std::mem::replace(&mut inner.value, value));
            true
        });
    }

    /// Submit a new action whose body writes this state.
    pub fn update_with_action(&self, value: T, cause: &str) {
        let Some(shared) = self.graph.upgrade() else {
            return;
        };
        let this = self.clone();
        Graph::from_shared(shared).action(cause, move || this.update(value));
    }

    /// The current value.
    pub fn value(&self) -> T {
        runtime::with_core(&self.graph, (), |core| core.verify_demand(self.id));
        self.cell.inner.lock().value.clone()
    }

    /// The value held immediately before the current event's update.
    ///
    /// Outside an event, or when the state did not update this event, this is
    /// the current value.
    pub fn trace_value(&self) -> T {
        let inner = self.cell.inner.lock();
        match &inner.prev {
            Some(prev) => prev.clone(),
            None => inner.value.clone(),
        }
    }

    pub fn event(&self) -> Event {
        runtime::with_core(&self.graph, Event::unknown_past(), |core| {
            core.verify_demand(self.id);
            core.resource_event(self.id)
        })
    }

    pub fn trace_event(&self) -> Event {
        runtime::with_core(&self.graph, Event::unknown_past(), |core| {
            core.resource_trace_event(self.id)
        })
    }

    pub fn just_updated(&self) -> bool {
        runtime::with_core(&self.graph, false, |core| {
            core.verify_demand(self.id);
            core.resource_just_updated(self.id)
        })
    }

    /// True iff the state updated this event and the new value compares equal
    /// to `value` under the equality policy. Always false without a policy.
    pub fn just_updated_to(&self, value: &T) -> bool {
        self.just_updated() && self.compare_current(value)
    }

    /// True iff the state updated this event and the traced previous value
    /// compares equal to `value`. Always false without a policy.
    pub fn just_updated_from(&self, value: &T) -> bool {
        self.just_updated() && self.compare_trace(value)
    }

    pub fn just_updated_to_from(&self, to: &T, from: &T) -> bool {
        self.just_updated() && self.compare_current(to) && self.compare_trace(from)
    }

    pub fn has_updated(&self) -> bool {
        self.event().sequence() > 0
    }

    fn compare_current(&self, other: &T) -> bool {
        let Some(compare) = &self.cell.compare else {
            return false;
        };
        let inner = self.cell.inner.lock();
        compare(&inner.value, other)
    }

    fn compare_trace(&self, other: &T) -> bool {
        let Some(compare) = &self.cell.compare else {
            return false;
        };
        let inner = self.cell.inner.lock();
        match &inner.prev {
            Some(prev) => compare(prev, other),
            None => compare(&inner.value, other),
        }
    }
}

impl<T> Clone for State<T>
where
    T: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for State<T>
where
    T: Clone + Send + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("value", &self.cell.inner.lock().value)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
