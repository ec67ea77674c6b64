//! Dependency Graph Engine
//!
//! This module implements the reactive dependency-graph runtime: stateful
//! resources, behaviors that read and write them, and the event loop that
//! re-runs exactly the affected behaviors, exactly once, in dependency
//! order, per logical transaction.
//!
//! # Concepts
//!
//! ## Resources
//!
//! A resource is a reactive cell with at most one supplying behavior and a
//! set of demanding behaviors. `Moment` is a bare signal, `TypedMoment`
//! carries a transient payload, `State` holds a persistent value with an
//! equality policy.
//!
//! ## Behaviors
//!
//! A behavior declares the resources it reads (demands) and writes
//! (supplies) and carries an integer topological order derived from those
//! edges. Demand and supply sets may be partly dynamic, recomputed at
//! runtime by implicit resolver behaviors.
//!
//! ## Extents
//!
//! Resources and behaviors sharing a lifetime are grouped into an extent and
//! enter or leave the graph atomically.
//!
//! ## Events
//!
//! External code submits actions; each action becomes one event, a single
//! transaction that runs to a fixed point before its side effects become
//! observable.

mod behavior;
mod error;
mod event;
mod extent;
mod link;
mod resource;
mod runtime;
mod scheduler;

pub use behavior::{Behavior, BehaviorId};
pub use error::GraphError;
pub use event::Event;
pub use extent::{BehaviorBuilder, Extent, ExtentBuilder, ExtentId, ResolveOrder};
pub use link::{DemandLink, LinkKind, ResourceRef};
pub use resource::{Moment, ResourceId, State, TypedMoment};
pub use runtime::{Graph, GraphConfig, Mode, PreAddWrites};
