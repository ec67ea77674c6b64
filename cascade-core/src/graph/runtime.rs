//! Graph Runtime
//!
//! The runtime is the central coordinator: it owns the arena of resources,
//! behaviors, and extents, the action and side-effect queues, the behavior
//! scheduler, and the lock that serializes everything. External code submits
//! actions; the runtime turns each action into one event and drives it to a
//! fixed point.
//!
//! # Event loop
//!
//! Within one event the loop advances through a fixed sequence of phases,
//! re-entering earlier phases whenever new work appears:
//!
//! 1. Run the action body; its resource writes form the initial update set.
//! 2. Commit structural changes: newly added extents, then modified supply
//!    and demand sets, diffing new edges against old and fixing
//!    back-references.
//! 3. Re-order behaviors whose demands changed order-sensitively, with cycle
//!    detection.
//! 4. Propagate updates: every written resource pushes its reactive
//!    subsequents onto the scheduler.
//! 5. Pop and run the lowest-order scheduled behavior; repeat from 2 until
//!    the scheduler drains (lane-flagged behaviors are batched to the end of
//!    the drain round).
//! 6. Run queued side effects in creation order.
//! 7. Clear transient payloads, then stamp the event as last and either
//!    start the next queued action or go idle.
//!
//! # Locking
//!
//! One reentrant gate serializes events; a second plain mutex guards the
//! core state. User closures (action bodies, behavior bodies, side effects,
//! violation hooks, payload drops) always run with the core mutex released,
//! so they may freely re-enter the public API; the gate makes that
//! re-entrance safe on the same thread while excluding all others.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::graph::behavior::{BehaviorId, BehaviorNode, OrderingState};
use crate::graph::error::GraphError;
use crate::graph::event::Event;
use crate::graph::extent::{ExtentId, ExtentNode, ExtentState};
use crate::graph::link::{DemandEdge, DemandLink, LinkKind, ResourceRef, SubsequentEdge};
use crate::graph::resource::{ResourceId, ResourceKind, ResourceNode, TransientCell};
use crate::graph::scheduler::BehaviorQueue;
use crate::sync::{DesignatedLane, RecursiveMutex, WorkQueue};

/// How action submission synchronizes with the event loop.
#[derive(Debug)]
pub enum Mode {
    /// Try to run on the calling thread; if another thread is mid-event,
    /// fall back to the default queue. The permitted mode everywhere,
    /// including inside actions and behaviors (the action then runs after
    /// the current event).
    Default,
    /// Block until the action and everything it triggers has drained.
    /// Illegal from inside an action or behavior body.
    Sync,
    /// Queue on the given work queue (the graph's default queue if `None`)
    /// and return immediately.
    Async(Option<WorkQueue>),
}

/// Whether a resource may be written in the same event its extent is added
/// but before `add_to_graph` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreAddWrites {
    /// Such writes raise `GraphError::ResourceNotAttached`.
    Reject,
    /// Such writes stamp the event; a demand committed later in the same
    /// event sees the resource as just-updated and activates.
    Permit,
}

/// Construction-time configuration for a graph.
#[derive(Clone)]
pub struct GraphConfig {
    pub pre_add_writes: PreAddWrites,
    /// Fail loudly when a behavior reads a resource it did not declare as a
    /// demand.
    pub check_undeclared_demands: bool,
    /// Clock used to timestamp events; defaults to `SystemTime::now`.
    pub clock: Option<Arc<dyn Fn() -> SystemTime + Send + Sync>>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            pre_add_writes: PreAddWrites::Reject,
            check_undeclared_demands: false,
            clock: None,
        }
    }
}

impl std::fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConfig")
            .field("pre_add_writes", &self.pre_add_writes)
            .field("check_undeclared_demands", &self.check_undeclared_demands)
            .field("clock", &self.clock.as_ref().map(|_| "custom"))
            .finish()
    }
}

struct Action {
    cause: String,
    body: Box<dyn FnOnce() + Send>,
}

struct SideEffect {
    label: String,
    body: Box<dyn FnOnce() + Send>,
}

struct EventLoopState {
    event: Event,
    processing_action: bool,
    processing_changes: bool,
}

/// What the event loop should do next. Steps that invoke user code are
/// returned to the driver so they run with the core mutex released.
enum Step {
    Continue,
    Finished,
    StartAction(Box<dyn FnOnce() + Send>),
    RunBehavior(Arc<dyn Fn(&Graph) + Send + Sync>),
    RunLaneBatch,
    RunSideEffects,
    ClearTransients(Vec<Arc<dyn TransientCell>>),
}

enum LanePrep {
    Empty,
    Skip,
    Run(Arc<dyn Fn(&Graph) + Send + Sync>),
}

/// Unlocks one gate level on drop, unwinding included.
struct GateRelease<'a>(&'a RecursiveMutex);

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Nodes detached from the arena, carried out of the lock scopes before they
/// drop. A behavior body may own the last handle to another extent, whose
/// drop schedules a removal action; that must not happen while the core
/// mutex is held.
#[derive(Default)]
pub(crate) struct RemovedNodes {
    _resources: Vec<ResourceNode>,
    _behaviors: Vec<BehaviorNode>,
}

pub(crate) struct GraphShared {
    pub(crate) gate: RecursiveMutex,
    pub(crate) core: Mutex<GraphCore>,
    hook: Mutex<Option<Arc<dyn Fn(&GraphError) + Send + Sync>>>,
    default_queue: WorkQueue,
}

impl GraphShared {
    /// Dispatch violations collected under the core lock. With a hook
    /// installed the violation is handed to it; otherwise debug builds
    /// panic and release builds log and continue.
    pub(crate) fn flush_violations(&self) {
        loop {
            let pending = std::mem::take(&mut self.core.lock().pending_violations);
            if pending.is_empty() {
                return;
            }
            let hook = self.hook.lock().clone();
            for error in pending {
                tracing::error!(%error, "graph violation");
                match &hook {
                    Some(hook) => hook(&error),
                    None => {
                        if cfg!(debug_assertions) {
                            panic!("graph violation: {error}");
                        }
                    }
                }
            }
        }
    }
}

/// The reactive dependency graph.
///
/// Cheap to clone; all clones share one engine. Resource and extent handles
/// hold weak references back to it, so dropping every `Graph` clone shuts
/// the engine down and turns the handles inert.
pub struct Graph {
    shared: Arc<GraphShared>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::with_config(GraphConfig::default())
    }

    pub fn with_config(config: GraphConfig) -> Self {
        let clock: Arc<dyn Fn() -> SystemTime + Send + Sync> = match config.clock.clone() {
            Some(clock) => clock,
            None => Arc::new(SystemTime::now),
        };
        Self {
            shared: Arc::new(GraphShared {
                gate: RecursiveMutex::new(),
                core: Mutex::new(GraphCore::new(config, clock)),
                hook: Mutex::new(None),
                default_queue: WorkQueue::new("cascade-default"),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<GraphShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<GraphShared> {
        Arc::downgrade(&self.shared)
    }

    /// Submit an action in `Default` mode.
    pub fn action(&self, cause: &str, body: impl FnOnce() + Send + 'static) {
        self.submit(cause, Mode::Default, body);
    }

    /// Submit an action synchronously: the call returns once the action and
    /// everything it triggered has drained.
    pub fn action_sync(&self, cause: &str, body: impl FnOnce() + Send + 'static) {
        self.submit(cause, Mode::Sync, body);
    }

    /// Queue an action on the graph's default work queue.
    pub fn action_async(&self, cause: &str, body: impl FnOnce() + Send + 'static) {
        self.submit(cause, Mode::Async(None), body);
    }

    /// Submit an action with an explicit synchronization mode.
    pub fn submit(&self, cause: &str, mode: Mode, body: impl FnOnce() + Send + 'static) {
        match mode {
            Mode::Sync => {
                self.shared.gate.with(|| {
                    let run = {
                        let mut core = self.shared.core.lock();
                        if core.processing_action() {
                            core.raise(GraphError::NestedSyncAction);
                            false
                        } else if core.processing_changes() {
                            core.raise(GraphError::SyncActionFromBehavior);
                            false
                        } else {
                            core.action_queue.push_back(Action {
                                cause: cause.to_string(),
                                body: Box::new(body),
                            });
                            true
                        }
                    };
                    if run {
                        self.event_loop();
                    }
                });
                self.shared.flush_violations();
            }
            Mode::Async(queue) => {
                let queue = queue.unwrap_or_else(|| self.shared.default_queue.clone());
                let graph = self.clone();
                let cause = cause.to_string();
                queue.post(move || graph.submit(&cause, Mode::Sync, body));
            }
            Mode::Default => {
                if self.shared.gate.try_lock() {
                    {
                        let _release = GateRelease(&self.shared.gate);
                        let run = {
                            let mut core = self.shared.core.lock();
                            core.action_queue.push_back(Action {
                                cause: cause.to_string(),
                                body: Box::new(body),
                            });
                            // Run now when idle or inside a side effect;
                            // actions queued from an action or behavior body
                            // run after the current event.
                            !core.processing_changes()
                        };
                        if run {
                            self.event_loop();
                        }
                    }
                    self.shared.flush_violations();
                } else {
                    self.submit(cause, Mode::Async(None), body);
                }
            }
        }
    }

    /// Queue a side effect for the current event.
    ///
    /// Legal only from inside an action or behavior body. Effects run in
    /// creation order after the event reaches its fixed point.
    pub fn side_effect(&self, label: &str, body: impl FnOnce() + Send + 'static) {
        with_shared(&self.shared, |core| {
            if core.event_loop_state.is_none() {
                core.raise(GraphError::SideEffectOutsideEvent);
                return;
            }
            core.side_effect_queue.push_back(SideEffect {
                label: label.to_string(),
                body: Box::new(body),
            });
        });
    }

    /// Install a hook receiving every violation instead of the default
    /// log-and-panic handling.
    pub fn set_violation_hook(&self, hook: impl Fn(&GraphError) + Send + Sync + 'static) {
        *self.shared.hook.lock() = Some(Arc::new(hook));
    }

    pub fn clear_violation_hook(&self) {
        *self.shared.hook.lock() = None;
    }

    /// Route side effects and lane-flagged behaviors to the given lane.
    pub fn set_designated_lane(&self, lane: DesignatedLane) {
        with_shared(&self.shared, |core| {
            core.lane = Some(lane);
        });
    }

    /// The event currently being processed, if any.
    pub fn current_event(&self) -> Option<Event> {
        with_shared(&self.shared, |core| {
            core.event_loop_state.as_ref().map(|state| state.event.clone())
        })
    }

    /// The most recently completed event.
    pub fn last_event(&self) -> Event {
        with_shared(&self.shared, |core| core.last_event.clone())
    }

    pub(crate) fn remove_dropped_extent(&self, id: ExtentId) {
        // Dropped after the lock scopes close; see `RemovedNodes`.
        let _removed = with_shared(&self.shared, |core| {
            match core.extents.get(&id).map(|node| node.state) {
                Some(ExtentState::Added) => core.remove_extent(id),
                Some(ExtentState::Inactive) => core.purge_extent(id),
                _ => RemovedNodes::default(),
            }
        });
    }

    /// Drive the current event (and any actions queued behind it) to
    /// completion. Must be called with the gate held.
    fn event_loop(&self) {
        loop {
            let step = self.shared.core.lock().next_step();
            self.shared.flush_violations();
            match step {
                Step::Continue => {}
                Step::Finished => return,
                Step::StartAction(body) => {
                    body();
                    self.shared.core.lock().finish_action();
                }
                Step::RunBehavior(body) => {
                    body(self);
                    self.shared.core.lock().finish_behavior();
                }
                Step::RunLaneBatch => self.run_lane_batch(),
                Step::RunSideEffects => self.run_side_effects(),
                Step::ClearTransients(cells) => {
                    let mut cleared = Vec::with_capacity(cells.len());
                    for cell in &cells {
                        if let Some(value) = cell.clear() {
                            cleared.push(value);
                        }
                    }
                    // Dropped only after the sweep completes: a payload drop
                    // may submit new actions, which must not observe a
                    // half-swept queue.
                    drop(cleared);
                }
            }
        }
    }

    fn run_side_effects(&self) {
        let lane = self.shared.core.lock().lane.clone();
        match lane {
            Some(lane) if !lane.is_current() => {
                let shared = Arc::clone(&self.shared);
                // Hand the whole batch to the lane thread, releasing the
                // gate across the rendezvous so the lane can take it.
                let depth = self.shared.gate.unlock_all();
                let handed_off = lane.run_sync(move || {
                    let graph = Graph::from_shared(shared);
                    graph.shared.gate.with(|| graph.drain_side_effects());
                    graph.shared.flush_violations();
                });
                self.shared.gate.lock_many(depth);
                if !handed_off {
                    self.drain_side_effects();
                }
            }
            _ => self.drain_side_effects(),
        }
    }

    fn drain_side_effects(&self) {
        loop {
            let effect = self.shared.core.lock().side_effect_queue.pop_front();
            let Some(effect) = effect else {
                return;
            };
            tracing::trace!(label = %effect.label, "running side effect");
            (effect.body)();
            self.shared.flush_violations();
        }
    }

    fn run_lane_batch(&self) {
        let lane = self.shared.core.lock().lane.clone();
        match lane {
            Some(lane) if !lane.is_current() => {
                let shared = Arc::clone(&self.shared);
                let depth = self.shared.gate.unlock_all();
                let handed_off = lane.run_sync(move || {
                    let graph = Graph::from_shared(shared);
                    graph.shared.gate.with(|| graph.drain_lane_batch());
                    graph.shared.flush_violations();
                });
                self.shared.gate.lock_many(depth);
                if !handed_off {
                    self.drain_lane_batch();
                }
            }
            _ => self.drain_lane_batch(),
        }
    }

    fn drain_lane_batch(&self) {
        loop {
            match self.shared.core.lock().prepare_lane_behavior() {
                LanePrep::Empty => return,
                LanePrep::Skip => {}
                LanePrep::Run(body) => {
                    body(self);
                    self.shared.core.lock().finish_behavior();
                    self.shared.flush_violations();
                }
            }
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Core state
// ----------------------------------------------------------------------------

pub(crate) struct GraphCore {
    config: GraphConfig,
    clock: Arc<dyn Fn() -> SystemTime + Send + Sync>,

    sequence: u64,
    last_event: Event,
    event_loop_state: Option<EventLoopState>,

    action_queue: VecDeque<Action>,
    side_effect_queue: VecDeque<SideEffect>,
    behavior_queue: BehaviorQueue,
    lane_batch: VecDeque<BehaviorId>,

    updated_resources: Vec<ResourceId>,
    updated_transients: Vec<ResourceId>,
    untracked_behaviors: Vec<BehaviorId>,
    modified_supplies: Vec<BehaviorId>,
    modified_demands: Vec<BehaviorId>,
    needs_ordering: Vec<BehaviorId>,
    current_running: Option<BehaviorId>,

    pub(crate) resources: IndexMap<ResourceId, ResourceNode>,
    pub(crate) behaviors: IndexMap<BehaviorId, BehaviorNode>,
    pub(crate) extents: IndexMap<ExtentId, ExtentNode>,

    pending_violations: Vec<GraphError>,
    lane: Option<DesignatedLane>,
}

impl GraphCore {
    fn new(config: GraphConfig, clock: Arc<dyn Fn() -> SystemTime + Send + Sync>) -> Self {
        Self {
            config,
            clock,
            sequence: 0,
            last_event: Event::unknown_past(),
            event_loop_state: None,
            action_queue: VecDeque::new(),
            side_effect_queue: VecDeque::new(),
            behavior_queue: BehaviorQueue::new(),
            lane_batch: VecDeque::new(),
            updated_resources: Vec::new(),
            updated_transients: Vec::new(),
            untracked_behaviors: Vec::new(),
            modified_supplies: Vec::new(),
            modified_demands: Vec::new(),
            needs_ordering: Vec::new(),
            current_running: None,
            resources: IndexMap::new(),
            behaviors: IndexMap::new(),
            extents: IndexMap::new(),
            pending_violations: Vec::new(),
            lane: None,
        }
    }

    pub(crate) fn raise(&mut self, error: GraphError) {
        self.pending_violations.push(error);
    }

    pub(crate) fn processing_changes(&self) -> bool {
        self.event_loop_state
            .as_ref()
            .map_or(false, |state| state.processing_changes)
    }

    fn processing_action(&self) -> bool {
        self.event_loop_state
            .as_ref()
            .map_or(false, |state| state.processing_action)
    }

    fn current_sequence(&self) -> Option<u64> {
        self.event_loop_state
            .as_ref()
            .map(|state| state.event.sequence())
    }

    fn finish_action(&mut self) {
        if let Some(state) = self.event_loop_state.as_mut() {
            state.processing_action = false;
        }
    }

    fn finish_behavior(&mut self) {
        self.current_running = None;
    }

    // ------------------------------------------------------------------
    // Event loop phases
    // ------------------------------------------------------------------

    fn next_step(&mut self) -> Step {
        if self.event_loop_state.is_some() {
            if self.processing_changes() {
                if !self.untracked_behaviors.is_empty() {
                    self.commit_untracked_behaviors();
                    return Step::Continue;
                }
                if !self.modified_supplies.is_empty() {
                    self.commit_modified_supplies();
                }
                if !self.modified_demands.is_empty() {
                    self.commit_modified_demands();
                }
                if !self.needs_ordering.is_empty() {
                    self.order_behaviors();
                }
                if !self.updated_resources.is_empty() {
                    self.propagate_updates();
                }
                if !self.behavior_queue.is_empty() {
                    return self.pop_runnable();
                }
                if !self.lane_batch.is_empty() {
                    return Step::RunLaneBatch;
                }
                if let Some(state) = self.event_loop_state.as_mut() {
                    state.processing_changes = false;
                }
            }
            if !self.side_effect_queue.is_empty() {
                return Step::RunSideEffects;
            }
            if !self.updated_transients.is_empty() {
                let ids = std::mem::take(&mut self.updated_transients);
                let cells = ids
                    .into_iter()
                    .filter_map(|id| self.resources.get(&id).and_then(|node| node.transient.clone()))
                    .collect();
                return Step::ClearTransients(cells);
            }
            if let Some(state) = self.event_loop_state.take() {
                tracing::debug!(sequence = state.event.sequence(), "event complete");
                self.last_event = state.event;
            }
        }
        if let Some(action) = self.action_queue.pop_front() {
            self.sequence += 1;
            tracing::debug!(sequence = self.sequence, cause = %action.cause, "event begins");
            let event = Event::new(self.sequence, (self.clock)(), Some(action.cause));
            self.event_loop_state = Some(EventLoopState {
                event,
                processing_action: true,
                processing_changes: true,
            });
            return Step::StartAction(action.body);
        }
        Step::Finished
    }

    fn pop_runnable(&mut self) -> Step {
        let popped = {
            let (queue, behaviors) = (&mut self.behavior_queue, &self.behaviors);
            let order_of = |id: BehaviorId| behaviors.get(&id).map(|node| node.order);
            match queue.peek(order_of) {
                Some(id) => {
                    queue.pop(order_of);
                    Some(id)
                }
                None => None,
            }
        };
        let Some(id) = popped else {
            return Step::Continue;
        };
        let lane_deferred = self
            .behaviors
            .get(&id)
            .map_or(false, |node| node.on_designated_lane)
            && self.lane.as_ref().map_or(false, |lane| !lane.is_current());
        if lane_deferred {
            self.lane_batch.push_back(id);
            return Step::Continue;
        }
        let sequence = self.sequence;
        // A behavior whose extent was removed this event has no node left
        // and is skipped.
        let Some(node) = self.behaviors.get_mut(&id) else {
            return Step::Continue;
        };
        debug_assert!(
            node.last_run_sequence < sequence,
            "behavior ran twice in one event"
        );
        node.last_run_sequence = sequence;
        let body = Arc::clone(&node.body);
        let order = node.order;
        self.current_running = Some(id);
        tracing::trace!(behavior = id.raw(), order, "running behavior");
        Step::RunBehavior(body)
    }

    fn prepare_lane_behavior(&mut self) -> LanePrep {
        let Some(id) = self.lane_batch.pop_front() else {
            return LanePrep::Empty;
        };
        let sequence = self.sequence;
        let Some(node) = self.behaviors.get_mut(&id) else {
            return LanePrep::Skip;
        };
        debug_assert!(
            node.last_run_sequence < sequence,
            "behavior ran twice in one event"
        );
        node.last_run_sequence = sequence;
        let body = Arc::clone(&node.body);
        self.current_running = Some(id);
        tracing::trace!(behavior = id.raw(), "running behavior on designated lane");
        LanePrep::Run(body)
    }

    fn commit_untracked_behaviors(&mut self) {
        let untracked = std::mem::take(&mut self.untracked_behaviors);
        for id in untracked {
            let Some(node) = self.behaviors.get(&id) else {
                continue;
            };
            if node.uncommitted_supplies {
                self.modified_supplies.push(id);
            }
            if node.uncommitted_demands {
                self.modified_demands.push(id);
            }
        }
    }

    fn commit_modified_supplies(&mut self) {
        let modified = std::mem::take(&mut self.modified_supplies);
        for id in modified {
            let (old, statics, dynamic) = match self.behaviors.get(&id) {
                Some(node) if node.uncommitted_supplies => (
                    node.supplies.clone(),
                    node.static_supplies.clone(),
                    node.uncommitted_dynamic_supplies.clone(),
                ),
                _ => continue,
            };

            let mut new: IndexSet<ResourceId> = statics
                .iter()
                .copied()
                .filter(|rid| self.resources.contains_key(rid))
                .collect();
            if let Some(dynamic) = dynamic {
                for rid in dynamic {
                    let supplier = match self.resources.get(&rid) {
                        Some(resource) => resource.supplier,
                        None => continue,
                    };
                    if let Some(existing) = supplier {
                        if existing != id {
                            self.raise(GraphError::DoubleSupply {
                                resource: rid,
                                supplier: existing,
                                attempted: id,
                            });
                            continue;
                        }
                    }
                    new.insert(rid);
                }
            }

            let removed: Vec<ResourceId> = old.difference(&new).copied().collect();
            let added: Vec<ResourceId> = new.difference(&old).copied().collect();

            if let Some(node) = self.behaviors.get_mut(&id) {
                node.supplies = new;
                node.uncommitted_dynamic_supplies = None;
                node.uncommitted_supplies = false;
            }

            for rid in removed {
                if let Some(resource) = self.resources.get_mut(&rid) {
                    if resource.supplier == Some(id) {
                        resource.supplier = None;
                    }
                }
            }

            let my_order = self.behaviors.get(&id).map_or(0, |node| node.order);
            for rid in added {
                let subsequents: Vec<SubsequentEdge> = match self.resources.get_mut(&rid) {
                    Some(resource) => {
                        resource.supplier = Some(id);
                        resource.subsequents.iter().copied().collect()
                    }
                    None => continue,
                };
                let mut dead: SmallVec<[SubsequentEdge; 4]> = SmallVec::new();
                for edge in subsequents {
                    match self.behaviors.get(&edge.behavior) {
                        Some(subsequent) => {
                            if subsequent.order <= my_order {
                                self.needs_ordering.push(edge.behavior);
                            }
                        }
                        None => dead.push(edge),
                    }
                }
                if !dead.is_empty() {
                    if let Some(resource) = self.resources.get_mut(&rid) {
                        for edge in dead {
                            resource.subsequents.swap_remove(&edge);
                        }
                    }
                }
            }
        }
    }

    fn commit_modified_demands(&mut self) {
        let modified = std::mem::take(&mut self.modified_demands);
        for id in modified {
            let (old, statics, dynamic) = match self.behaviors.get(&id) {
                Some(node) if node.uncommitted_demands => (
                    node.demands.clone(),
                    node.static_demands.clone(),
                    node.uncommitted_dynamic_demands.clone(),
                ),
                _ => continue,
            };

            let mut new: IndexSet<DemandEdge> = statics
                .iter()
                .copied()
                .filter(|edge| self.resources.contains_key(&edge.resource))
                .collect();
            if let Some(dynamic) = dynamic {
                for edge in dynamic {
                    if self.resources.contains_key(&edge.resource) {
                        new.insert(edge);
                    }
                }
            }

            let removed: Vec<DemandEdge> = old.difference(&new).copied().collect();
            let added: Vec<DemandEdge> = new.difference(&old).copied().collect();

            if let Some(node) = self.behaviors.get_mut(&id) {
                node.demands = new;
                node.uncommitted_dynamic_demands = None;
                node.uncommitted_demands = false;
            }

            for edge in removed {
                if let Some(resource) = self.resources.get_mut(&edge.resource) {
                    resource.subsequents.swap_remove(&SubsequentEdge {
                        behavior: id,
                        kind: edge.kind,
                    });
                }
            }

            let my_order = self.behaviors.get(&id).map_or(0, |node| node.order);
            let current_sequence = self.current_sequence();
            let mut needs_ordering = false;
            let mut activated = false;
            for edge in added {
                let (supplier, just_updated) = match self.resources.get_mut(&edge.resource) {
                    Some(resource) => {
                        resource.subsequents.insert(SubsequentEdge {
                            behavior: id,
                            kind: edge.kind,
                        });
                        (
                            resource.supplier,
                            current_sequence == Some(resource.last_event.sequence()),
                        )
                    }
                    None => continue,
                };
                if edge.kind == LinkKind::Reactive && just_updated {
                    activated = true;
                }
                if !needs_ordering {
                    if let Some(prior) = supplier {
                        let prior_order = self.behaviors.get(&prior).map_or(0, |node| node.order);
                        if prior_order >= my_order {
                            needs_ordering = true;
                        }
                    }
                }
            }
            if needs_ordering {
                self.needs_ordering.push(id);
            }
            if activated {
                self.submit_to_queue(id);
            }
        }
    }

    /// Breadth-first collect everything reachable forward from the behaviors
    /// whose edges changed, then depth-first assign orders.
    fn order_behaviors(&mut self) {
        let mut traversal: VecDeque<BehaviorId> =
            std::mem::take(&mut self.needs_ordering).into();
        let mut to_order = Vec::new();
        while let Some(id) = traversal.pop_front() {
            let supplies = match self.behaviors.get_mut(&id) {
                Some(node) if node.ordering_state != OrderingState::Unordered => {
                    node.ordering_state = OrderingState::Unordered;
                    to_order.push(id);
                    node.supplies.iter().copied().collect::<Vec<_>>()
                }
                _ => continue,
            };
            for rid in supplies {
                if let Some(resource) = self.resources.get(&rid) {
                    traversal.extend(resource.subsequents.iter().map(|edge| edge.behavior));
                }
            }
        }

        let mut needs_reheap = false;
        for id in to_order {
            self.sort_dfs(id, &mut needs_reheap);
        }
        if needs_reheap {
            self.behavior_queue.set_needs_reheap();
        }
    }

    fn sort_dfs(&mut self, id: BehaviorId, needs_reheap: &mut bool) {
        let state = match self.behaviors.get(&id) {
            Some(node) => node.ordering_state,
            None => return,
        };
        match state {
            OrderingState::Ordering => {
                // Reached while its own ordering is still in progress: the
                // demand edges close a cycle.
                self.raise(GraphError::DependencyCycle { behavior: id });
                return;
            }
            OrderingState::Ordered => return,
            OrderingState::Unordered => {}
        }
        if let Some(node) = self.behaviors.get_mut(&id) {
            node.ordering_state = OrderingState::Ordering;
        }

        let demands: Vec<DemandEdge> = self
            .behaviors
            .get(&id)
            .map(|node| node.demands.iter().copied().collect())
            .unwrap_or_default();
        let mut order = 1u64;
        let mut dead: SmallVec<[DemandEdge; 4]> = SmallVec::new();
        for edge in demands {
            let supplier = match self.resources.get(&edge.resource) {
                Some(resource) => resource.supplier,
                None => {
                    dead.push(edge);
                    continue;
                }
            };
            if let Some(prior) = supplier {
                let prior_state = self.behaviors.get(&prior).map(|node| node.ordering_state);
                if prior_state.is_some() && prior_state != Some(OrderingState::Ordered) {
                    self.sort_dfs(prior, needs_reheap);
                }
                let prior_order = self.behaviors.get(&prior).map_or(0, |node| node.order);
                order = order.max(prior_order + 1);
            }
        }

        if let Some(node) = self.behaviors.get_mut(&id) {
            for edge in dead {
                node.demands.swap_remove(&edge);
            }
            node.ordering_state = OrderingState::Ordered;
            if node.order != order {
                node.order = order;
                *needs_reheap = true;
            }
        }
    }

    fn propagate_updates(&mut self) {
        let updated = std::mem::take(&mut self.updated_resources);
        for rid in updated {
            let subsequents: Vec<SubsequentEdge> = match self.resources.get(&rid) {
                Some(resource) => resource.subsequents.iter().copied().collect(),
                None => continue,
            };
            let mut dead: SmallVec<[SubsequentEdge; 4]> = SmallVec::new();
            for edge in subsequents {
                if edge.kind != LinkKind::Reactive {
                    continue;
                }
                if self.behaviors.contains_key(&edge.behavior) {
                    self.submit_to_queue(edge.behavior);
                } else {
                    dead.push(edge);
                }
            }
            if !dead.is_empty() {
                if let Some(resource) = self.resources.get_mut(&rid) {
                    for edge in dead {
                        resource.subsequents.swap_remove(&edge);
                    }
                }
            }
        }
    }

    fn submit_to_queue(&mut self, id: BehaviorId) {
        debug_assert!(
            self.processing_changes(),
            "behavior activation outside the change-processing phase"
        );
        let sequence = self.sequence;
        if let Some(node) = self.behaviors.get_mut(&id) {
            if node.enqueued_sequence < sequence {
                node.enqueued_sequence = sequence;
                self.behavior_queue.push(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutation legality
    // ------------------------------------------------------------------

    /// Check whether the resource may be written right now. Returns the
    /// current event on success; on failure a violation is raised (or, for
    /// inert resources, nothing happens) and `None` is returned.
    pub(crate) fn check_writable(&mut self, id: ResourceId) -> Option<Event> {
        // A missing node means the extent was removed or the graph never
        // knew the resource: updates are inert.
        let (owner, supplier, last_sequence) = match self.resources.get(&id) {
            Some(resource) => (
                resource.owner,
                resource.supplier,
                resource.last_event.sequence(),
            ),
            None => return None,
        };
        let (event, processing_action) = match &self.event_loop_state {
            Some(state) => (state.event.clone(), state.processing_action),
            None => {
                self.raise(GraphError::UpdateOutsideEvent { resource: id });
                return None;
            }
        };
        let (extent_state, is_added_marker) = match self.extents.get(&owner) {
            Some(extent) => (extent.state, extent.added == id),
            None => return None,
        };
        match extent_state {
            ExtentState::Added => {}
            ExtentState::Inactive => {
                if self.config.pre_add_writes == PreAddWrites::Reject {
                    self.raise(GraphError::ResourceNotAttached { resource: id });
                    return None;
                }
            }
            ExtentState::Removed => return None,
        }
        match supplier {
            Some(behavior) => {
                if self.current_running != Some(behavior) {
                    self.raise(GraphError::WrongSupplier {
                        resource: id,
                        running: self.current_running,
                    });
                    return None;
                }
            }
            None => {
                // The implicit added marker is written by the graph itself
                // during admission; everything else unsupplied needs a
                // top-level action.
                if !is_added_marker && !processing_action {
                    self.raise(GraphError::UpdateOutsideAction { resource: id });
                    return None;
                }
            }
        }
        if last_sequence >= event.sequence() {
            self.raise(GraphError::DoubleUpdate { resource: id });
            return None;
        }
        Some(event)
    }

    pub(crate) fn commit_update(&mut self, id: ResourceId, event: Event, transient: bool) {
        if let Some(resource) = self.resources.get_mut(&id) {
            resource.prev_event = std::mem::replace(&mut resource.last_event, event);
            self.updated_resources.push(id);
            if transient {
                self.updated_transients.push(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Resource reads
    // ------------------------------------------------------------------

    pub(crate) fn resource_event(&self, id: ResourceId) -> Event {
        self.resources
            .get(&id)
            .map(|resource| resource.last_event.clone())
            .unwrap_or_else(Event::unknown_past)
    }

    pub(crate) fn resource_trace_event(&self, id: ResourceId) -> Event {
        let Some(resource) = self.resources.get(&id) else {
            return Event::unknown_past();
        };
        match self.current_sequence() {
            Some(sequence) if sequence == resource.last_event.sequence() => {
                resource.prev_event.clone()
            }
            _ => resource.last_event.clone(),
        }
    }

    pub(crate) fn resource_just_updated(&self, id: ResourceId) -> bool {
        match (self.current_sequence(), self.resources.get(&id)) {
            (Some(sequence), Some(resource)) => resource.last_event.sequence() == sequence,
            _ => false,
        }
    }

    /// With demand verification enabled: raise when the currently running
    /// behavior reads a resource it neither supplies nor demands.
    pub(crate) fn verify_demand(&mut self, id: ResourceId) {
        if !self.config.check_undeclared_demands {
            return;
        }
        let Some(current) = self.current_running else {
            return;
        };
        let supplier = self.resources.get(&id).and_then(|resource| resource.supplier);
        if supplier == Some(current) {
            return;
        }
        let declared = match self.behaviors.get(&current) {
            Some(node) => node.demands.iter().any(|edge| edge.resource == id),
            None => return,
        };
        if !declared {
            self.raise(GraphError::UndeclaredDemand {
                behavior: current,
                resource: id,
            });
        }
    }

    // ------------------------------------------------------------------
    // Structural mutation entry points
    // ------------------------------------------------------------------

    pub(crate) fn stage_dynamic_demands(&mut self, id: BehaviorId, edges: Vec<DemandEdge>) {
        if let Some(node) = self.behaviors.get_mut(&id) {
            node.uncommitted_dynamic_demands = Some(edges);
            node.uncommitted_demands = true;
            self.modified_demands.push(id);
        }
    }

    pub(crate) fn stage_dynamic_supplies(&mut self, id: BehaviorId, resources: Vec<ResourceId>) {
        if let Some(node) = self.behaviors.get_mut(&id) {
            node.uncommitted_dynamic_supplies = Some(resources);
            node.uncommitted_supplies = true;
            self.modified_supplies.push(id);
        }
    }

    pub(crate) fn add_extent(&mut self, id: ExtentId) {
        if !self.processing_changes() {
            self.raise(GraphError::AddExtentOutsideEvent { extent: id });
            return;
        }
        let (state, added, behaviors) = match self.extents.get(&id) {
            Some(node) => (node.state, node.added, node.behaviors.clone()),
            None => return,
        };
        if state != ExtentState::Inactive {
            self.raise(GraphError::ExtentAlreadyAdded { extent: id });
            return;
        }
        if self
            .resources
            .get(&added)
            .map_or(false, |node| node.last_event.sequence() > 0)
        {
            self.raise(GraphError::ExtentAlreadyAdded { extent: id });
            return;
        }
        if let Some(node) = self.extents.get_mut(&id) {
            node.state = ExtentState::Added;
        }
        let event = match &self.event_loop_state {
            Some(state) => state.event.clone(),
            None => return,
        };
        tracing::debug!(extent = id.raw(), "extent added");
        self.commit_update(added, event, false);
        self.untracked_behaviors.extend(behaviors);
    }

    pub(crate) fn remove_extent(&mut self, id: ExtentId) -> RemovedNodes {
        if !self.processing_changes() {
            self.raise(GraphError::RemoveExtentOutsideEvent { extent: id });
            return RemovedNodes::default();
        }
        let state = match self.extents.get(&id) {
            Some(node) => node.state,
            None => return RemovedNodes::default(),
        };
        match state {
            ExtentState::Removed => return RemovedNodes::default(),
            ExtentState::Inactive => return self.purge_extent(id),
            ExtentState::Added => {}
        }
        tracing::debug!(extent = id.raw(), "extent removed");
        let (resources, behaviors) = match self.extents.get_mut(&id) {
            Some(node) => {
                node.state = ExtentState::Removed;
                (
                    std::mem::take(&mut node.resources),
                    std::mem::take(&mut node.behaviors),
                )
            }
            None => return RemovedNodes::default(),
        };

        for rid in &resources {
            let (subsequents, supplier) = match self.resources.get(rid) {
                Some(resource) => (
                    resource.subsequents.iter().copied().collect::<Vec<_>>(),
                    resource.supplier,
                ),
                None => continue,
            };
            for edge in subsequents {
                if let Some(behavior) = self.behaviors.get_mut(&edge.behavior) {
                    behavior.demands.swap_remove(&DemandEdge {
                        resource: *rid,
                        kind: edge.kind,
                    });
                }
            }
            if let Some(supplier) = supplier {
                if let Some(behavior) = self.behaviors.get_mut(&supplier) {
                    behavior.supplies.swap_remove(rid);
                }
            }
        }

        for bid in &behaviors {
            let (supplies, static_supplies, demands) = match self.behaviors.get(bid) {
                Some(node) => (
                    node.supplies.iter().copied().collect::<Vec<_>>(),
                    node.static_supplies.iter().copied().collect::<Vec<_>>(),
                    node.demands.iter().copied().collect::<Vec<_>>(),
                ),
                None => continue,
            };
            // Static supplies cover the window between registration and the
            // first structural commit, when back-references already exist
            // but the committed set is still empty.
            for rid in supplies.into_iter().chain(static_supplies) {
                if let Some(resource) = self.resources.get_mut(&rid) {
                    if resource.supplier == Some(*bid) {
                        resource.supplier = None;
                    }
                }
            }
            for edge in demands {
                if let Some(resource) = self.resources.get_mut(&edge.resource) {
                    resource.subsequents.swap_remove(&SubsequentEdge {
                        behavior: *bid,
                        kind: edge.kind,
                    });
                }
            }
        }

        let mut removed = RemovedNodes::default();
        for rid in resources {
            if let Some(node) = self.resources.swap_remove(&rid) {
                removed._resources.push(node);
            }
        }
        for bid in behaviors {
            if let Some(node) = self.behaviors.swap_remove(&bid) {
                removed._behaviors.push(node);
            }
        }
        removed
    }

    /// Discard an extent that was never added: its nodes leave the arena
    /// without the in-event ceremony removal requires.
    pub(crate) fn purge_extent(&mut self, id: ExtentId) -> RemovedNodes {
        let (resources, behaviors) = match self.extents.get_mut(&id) {
            Some(node) if node.state == ExtentState::Inactive => {
                node.state = ExtentState::Removed;
                (
                    std::mem::take(&mut node.resources),
                    std::mem::take(&mut node.behaviors),
                )
            }
            _ => return RemovedNodes::default(),
        };
        for bid in &behaviors {
            let static_supplies: Vec<ResourceId> = match self.behaviors.get(bid) {
                Some(node) => node.static_supplies.iter().copied().collect(),
                None => continue,
            };
            for rid in static_supplies {
                if let Some(resource) = self.resources.get_mut(&rid) {
                    if resource.supplier == Some(*bid) {
                        resource.supplier = None;
                    }
                }
            }
        }
        let mut removed = RemovedNodes::default();
        for rid in resources {
            if let Some(node) = self.resources.swap_remove(&rid) {
                removed._resources.push(node);
            }
        }
        for bid in behaviors {
            if let Some(node) = self.behaviors.swap_remove(&bid) {
                removed._behaviors.push(node);
            }
        }
        removed
    }
}

// ----------------------------------------------------------------------------
// Crate-internal access helpers
// ----------------------------------------------------------------------------

/// Run `f` against the core with the gate held, then dispatch any collected
/// violations.
pub(crate) fn with_shared<R>(
    shared: &Arc<GraphShared>,
    f: impl FnOnce(&mut GraphCore) -> R,
) -> R {
    let result = shared.gate.with(|| f(&mut shared.core.lock()));
    shared.flush_violations();
    result
}

/// As `with_shared`, for weak graph references; returns `fallback` when the
/// graph is gone.
pub(crate) fn with_core<R>(
    graph: &Weak<GraphShared>,
    fallback: R,
    f: impl FnOnce(&mut GraphCore) -> R,
) -> R {
    match graph.upgrade() {
        Some(shared) => with_shared(&shared, f),
        None => fallback,
    }
}

/// The write path shared by every resource kind: check legality, let the
/// caller mutate its payload cell (with the core unlocked), then stamp the
/// event and record the update. `apply` returns false to turn the write into
/// a silent no-op (the equality policy).
pub(crate) fn update_resource(
    graph: &Weak<GraphShared>,
    id: ResourceId,
    transient: bool,
    apply: impl FnOnce(&Event) -> bool,
) {
    let Some(shared) = graph.upgrade() else {
        return;
    };
    shared.gate.with(|| {
        let event = shared.core.lock().check_writable(id);
        let Some(event) = event else {
            return;
        };
        if apply(&event) {
            shared.core.lock().commit_update(id, event, transient);
        }
    });
    shared.flush_violations();
}

pub(crate) fn create_extent(graph: &Graph) -> (ExtentId, ResourceId) {
    with_shared(&graph.shared, |core| {
        let extent = ExtentId::next();
        let added = ResourceId::next();
        core.resources
            .insert(added, ResourceNode::new(extent, None));
        core.extents.insert(
            extent,
            ExtentNode {
                state: ExtentState::Inactive,
                resources: vec![added],
                behaviors: Vec::new(),
                added,
            },
        );
        (extent, added)
    })
}

pub(crate) fn register_resource(
    graph: &Graph,
    extent: ExtentId,
    kind: ResourceKind,
    transient: Option<Arc<dyn TransientCell>>,
) -> ResourceId {
    let id = ResourceId::next();
    register_resource_with_id(graph, extent, id, kind, transient);
    id
}

pub(crate) fn register_resource_with_id(
    graph: &Graph,
    extent: ExtentId,
    id: ResourceId,
    kind: ResourceKind,
    transient: Option<Arc<dyn TransientCell>>,
) {
    tracing::trace!(resource = id.raw(), extent = extent.raw(), ?kind, "resource declared");
    with_shared(&graph.shared, |core| {
        core.resources.insert(id, ResourceNode::new(extent, transient));
        if let Some(node) = core.extents.get_mut(&extent) {
            node.resources.push(id);
        }
    });
}

pub(crate) fn register_behavior(
    graph: &Graph,
    extent: ExtentId,
    supplies: Vec<ResourceRef>,
    demands: Vec<DemandLink>,
    on_designated_lane: bool,
    body: Arc<dyn Fn(&Graph) + Send + Sync>,
) -> BehaviorId {
    let shared = Arc::clone(&graph.shared);
    with_shared(&graph.shared, move |core| {
        let id = BehaviorId::next();

        let mut static_supplies = IndexSet::new();
        for supply in &supplies {
            if !supply.belongs_to(&shared) {
                core.raise(GraphError::ForeignResource {
                    resource: supply.id,
                });
                continue;
            }
            let supplier = match core.resources.get(&supply.id) {
                Some(resource) => resource.supplier,
                None => continue,
            };
            if let Some(existing) = supplier {
                core.raise(GraphError::DoubleSupply {
                    resource: supply.id,
                    supplier: existing,
                    attempted: id,
                });
                continue;
            }
            static_supplies.insert(supply.id);
        }
        for rid in &static_supplies {
            if let Some(resource) = core.resources.get_mut(rid) {
                resource.supplier = Some(id);
            }
        }

        let mut static_demands = IndexSet::new();
        for link in &demands {
            if !link.belongs_to(&shared) || !core.resources.contains_key(&link.resource) {
                core.raise(GraphError::ForeignResource {
                    resource: link.resource,
                });
                continue;
            }
            static_demands.insert(link.edge());
        }

        core.behaviors.insert(
            id,
            BehaviorNode::new(
                extent,
                static_supplies,
                static_demands,
                on_designated_lane,
                body,
            ),
        );
        if let Some(node) = core.extents.get_mut(&extent) {
            node.behaviors.push(id);
        }
        id
    })
}

pub(crate) fn purge_extent(graph: &Graph, id: ExtentId) {
    // Dropped after the lock scopes close; see `RemovedNodes`.
    let _removed = with_shared(&graph.shared, |core| core.purge_extent(id));
}
