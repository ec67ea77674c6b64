//! Serial Work Queue
//!
//! Asynchronous action submissions land on a work queue: a single named
//! worker thread draining jobs in FIFO order, so actions submitted
//! asynchronously from one thread run in submission order. Each graph owns a
//! default queue; callers may create their own and pass it at submission
//! time.
//!
//! The handle is cheap to clone. When the last handle drops, the channel
//! closes and the worker thread exits after finishing the jobs already
//! queued.

use std::thread;

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO queue of jobs drained by one dedicated worker thread.
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    /// Spawn a worker thread with the given name and return its queue.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job();
                }
            })
            .expect("failed to spawn work queue thread");
        Self { sender }
    }

    /// Queue a job. Jobs run in submission order.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::warn!("work queue is shut down; job dropped");
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc as std_mpsc, Arc};
    use std::time::Duration;

    #[test]
    fn runs_jobs_in_submission_order() {
        let queue = WorkQueue::new("test-order");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();

        for i in 0..10 {
            let log = Arc::clone(&log);
            let done_tx = done_tx.clone();
            queue.post(move || {
                log.lock().push(i);
                if i == 9 {
                    done_tx.send(()).unwrap();
                }
            });
        }

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn clones_share_the_worker() {
        let queue = WorkQueue::new("test-clone");
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = std_mpsc::channel();

        let clone = queue.clone();
        let counter_a = Arc::clone(&counter);
        queue.post(move || {
            counter_a.fetch_add(1, Ordering::SeqCst);
        });
        let counter_b = Arc::clone(&counter);
        clone.post(move || {
            counter_b.fetch_add(1, Ordering::SeqCst);
            done_tx.send(()).unwrap();
        });

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
