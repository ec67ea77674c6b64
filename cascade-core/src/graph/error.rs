//! Violation Channel
//!
//! Every failure the engine can detect is a configuration or usage error: a
//! bug in how the graph was declared or in the calling discipline, never a
//! transient condition worth retrying. There is accordingly no `Result`
//! surface. Violations are reported through an installable hook; with no
//! hook installed they are logged and, in debug builds, abort the offending
//! test or program with a panic. Release builds log and continue, with the
//! violating operation reduced to a no-op.
//!
//! Tests install a hook to assert that an illegal configuration is in fact
//! rejected, without crashing the harness.

use thiserror::Error;

use crate::graph::behavior::BehaviorId;
use crate::graph::extent::ExtentId;
use crate::graph::resource::ResourceId;

/// A configuration or usage error detected by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A second live behavior declared an already-supplied resource as its
    /// supply.
    #[error("resource {resource:?} is already supplied by a different behavior")]
    DoubleSupply {
        resource: ResourceId,
        supplier: BehaviorId,
        attempted: BehaviorId,
    },

    /// The demand edges form a cycle.
    #[error("dependency cycle detected at behavior {behavior:?}")]
    DependencyCycle { behavior: BehaviorId },

    /// A link referenced a resource belonging to a different graph, or to no
    /// graph at all.
    #[error("resource {resource:?} does not belong to this graph")]
    ForeignResource { resource: ResourceId },

    /// A resource was written while no event was being processed.
    #[error("resource {resource:?} can only be updated during an event")]
    UpdateOutsideEvent { resource: ResourceId },

    /// A resource was written before its extent was added to the graph.
    #[error("resource {resource:?} belongs to an extent that has not been added to the graph")]
    ResourceNotAttached { resource: ResourceId },

    /// A supplied resource was written by something other than its supplier.
    #[error("resource {resource:?} can only be updated by its supplying behavior")]
    WrongSupplier {
        resource: ResourceId,
        running: Option<BehaviorId>,
    },

    /// An unsupplied resource was written from outside a top-level action.
    #[error("unsupplied resource {resource:?} can only be updated during an action")]
    UpdateOutsideAction { resource: ResourceId },

    /// A resource was written twice within one event.
    #[error("resource {resource:?} was already updated during this event")]
    DoubleUpdate { resource: ResourceId },

    /// Dynamic demands or supplies were modified while no event was being
    /// processed.
    #[error("links of behavior {behavior:?} can only be modified during an event")]
    LinkUpdateOutsideEvent { behavior: BehaviorId },

    /// An extent was added while no event was being processed.
    #[error("extent {extent:?} can only be added during an event")]
    AddExtentOutsideEvent { extent: ExtentId },

    /// An extent was added twice.
    #[error("extent {extent:?} was already added to the graph")]
    ExtentAlreadyAdded { extent: ExtentId },

    /// An extent was removed while no event was being processed.
    #[error("extent {extent:?} can only be removed during an event")]
    RemoveExtentOutsideEvent { extent: ExtentId },

    /// A synchronous action was submitted from inside a running action.
    #[error("nested actions cannot be executed synchronously")]
    NestedSyncAction,

    /// A synchronous action was submitted from inside a behavior body.
    #[error("actions originating from behavior closures cannot be executed synchronously")]
    SyncActionFromBehavior,

    /// A side effect was created while no event was being processed.
    #[error("side effects must be created inside actions or behaviors")]
    SideEffectOutsideEvent,

    /// With demand verification enabled: a behavior read a resource it did
    /// not declare as a demand.
    #[error("behavior {behavior:?} accessed resource {resource:?} without declaring it as a demand")]
    UndeclaredDemand {
        behavior: BehaviorId,
        resource: ResourceId,
    },
}
