//! Designated Lane
//!
//! Most graph work may run on whatever thread submitted the action, but some
//! work must land on one specific thread: UI mutations on a toolkit's main
//! thread are the canonical case. The lane models that thread as a second
//! logical execution lane coordinated through the graph's lock.
//!
//! `designated_lane()` returns a connected pair. The host hands the
//! `DesignatedLane` to the graph and pumps the `LaneExecutor` on the thread
//! that should perform the work (`run` for a dedicated loop, `drain` for
//! integration with an existing one). When the engine reaches work bound to
//! the lane (side-effect batches, lane-flagged behaviors) it releases the
//! graph lock, posts a job, and blocks until the lane thread has taken the
//! lock, run the batch, and acknowledged. This is a message-passing handoff,
//! not a second lock.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

type LaneJob = Box<dyn FnOnce() + Send + 'static>;

/// Sender half: held by the graph, posts batches to the lane thread.
#[derive(Clone)]
pub struct DesignatedLane {
    sender: mpsc::UnboundedSender<LaneJob>,
    thread: Arc<Mutex<Option<ThreadId>>>,
}

/// Receiver half: pumped by the thread that should run lane work.
pub struct LaneExecutor {
    receiver: mpsc::UnboundedReceiver<LaneJob>,
    thread: Arc<Mutex<Option<ThreadId>>>,
}

/// Create a connected lane pair.
pub fn designated_lane() -> (DesignatedLane, LaneExecutor) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let thread = Arc::new(Mutex::new(None));
    (
        DesignatedLane {
            sender,
            thread: Arc::clone(&thread),
        },
        LaneExecutor { receiver, thread },
    )
}

impl DesignatedLane {
    /// True when called from the thread that pumps the executor.
    ///
    /// Work already on the lane thread runs inline instead of being posted,
    /// which is also what breaks the handoff recursion for nested events.
    pub(crate) fn is_current(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    /// Post a job and block until the lane thread has run it.
    ///
    /// Returns false when the executor is gone, in which case the caller
    /// should run the work itself.
    pub(crate) fn run_sync(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let (ack_sender, ack_receiver) = oneshot::channel();
        let wrapped: LaneJob = Box::new(move || {
            job();
            let _ = ack_sender.send(());
        });
        if self.sender.send(wrapped).is_err() {
            return false;
        }
        // An error here means the executor dropped mid-batch; the job either
        // ran or never will, and there is nothing further to wait for.
        let _ = ack_receiver.blocking_recv();
        true
    }
}

impl std::fmt::Debug for DesignatedLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesignatedLane")
            .field("thread", &*self.thread.lock())
            .finish()
    }
}

impl LaneExecutor {
    /// Claim the current thread as the lane thread and run jobs until every
    /// `DesignatedLane` clone has been dropped.
    pub fn run(mut self) {
        self.claim();
        while let Some(job) = self.receiver.blocking_recv() {
            job();
        }
    }

    /// Claim the current thread and run the jobs queued so far, without
    /// blocking. Returns the number of jobs run.
    pub fn drain(&mut self) -> usize {
        self.claim();
        let mut count = 0;
        while let Ok(job) = self.receiver.try_recv() {
            job();
            count += 1;
        }
        count
    }

    fn claim(&self) {
        *self.thread.lock() = Some(thread::current().id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn run_sync_executes_on_lane_thread() {
        let (lane, executor) = designated_lane();
        let pump = thread::spawn(move || {
            let lane_thread = thread::current().id();
            executor.run();
            lane_thread
        });

        let ran_on = Arc::new(Mutex::new(None));
        let ran_on_clone = Arc::clone(&ran_on);
        assert!(lane.run_sync(move || {
            *ran_on_clone.lock() = Some(thread::current().id());
        }));

        drop(lane);
        let lane_thread = pump.join().unwrap();
        assert_eq!(*ran_on.lock(), Some(lane_thread));
    }

    #[test]
    fn run_sync_fails_without_executor() {
        let (lane, executor) = designated_lane();
        drop(executor);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        assert!(!lane.run_sync(move || ran_clone.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_runs_queued_jobs() {
        let (lane, mut executor) = designated_lane();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        // Post without waiting: wrap the send directly.
        let job: LaneJob = Box::new(move || ran_clone.store(true, Ordering::SeqCst));
        lane.sender.send(job).unwrap();

        assert_eq!(executor.drain(), 1);
        assert!(ran.load(Ordering::SeqCst));
        assert!(lane.is_current());
    }
}
