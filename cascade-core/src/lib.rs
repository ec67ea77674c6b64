//! Cascade Core
//!
//! This crate provides the core runtime for the Cascade reactive
//! dependency-graph engine. It implements:
//!
//! - Stateful resources (moments, typed moments, states) and behaviors with
//!   declared demand and supply edges
//! - A transactional event loop that re-runs exactly the affected behaviors,
//!   exactly once, in topological order
//! - Dynamic dependency resolution, extent lifecycles, and deferred side
//!   effects
//! - A concurrency layer serializing events from any number of submitting
//!   threads
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `graph`: the engine itself: resources, behaviors, extents, the
//!   scheduler, the event loop, and the violation channel
//! - `sync`: the reentrant graph lock, serial work queues for asynchronous
//!   submission, and the designated-lane handoff
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_core::graph::{ExtentBuilder, Graph};
//!
//! let graph = Graph::new();
//! let mut builder = ExtentBuilder::new(&graph);
//!
//! let celsius = builder.state_eq(0i32);
//! let fahrenheit = builder.state_eq(32i32);
//!
//! let out = fahrenheit.clone();
//! let input = celsius.clone();
//! builder
//!     .behavior()
//!     .supplies([fahrenheit.resource()])
//!     .demands([celsius.link()])
//!     .runs(move |_graph| {
//!         out.update(input.value() * 9 / 5 + 32);
//!     });
//!
//! let extent = builder.build();
//! extent.add_to_graph_with_action();
//!
//! celsius.update_with_action(100, "thermometer");
//! // fahrenheit.value() == 212 once the action drains
//! ```

pub mod graph;
pub mod sync;
