//! Concurrency Layer
//!
//! Three pieces keep the engine's single-writer model honest across threads:
//!
//! - `RecursiveMutex`: the reentrant lock serializing all graph mutation.
//!   Only one event is ever in flight; a thread holding the lock may lock
//!   again (side effects submitting synchronous actions rely on this).
//! - `WorkQueue`: a serial FIFO worker thread for asynchronous action
//!   submissions; each graph owns a default queue.
//! - `DesignatedLane` / `LaneExecutor`: a blocking handoff to one specific
//!   host thread for work that must land there.
//!
//! Resources and behaviors are only ever touched by the thread currently
//! holding the graph lock; all cross-thread interaction goes through the
//! action queue or the lane, never through shared field access.

mod lane;
mod mutex;
mod queue;

pub use lane::{designated_lane, DesignatedLane, LaneExecutor};
pub use queue::WorkQueue;

pub(crate) use mutex::RecursiveMutex;
