//! Recursive Mutex
//!
//! The graph serializes all actions and behavior execution under one
//! reentrant lock: a thread that already owns the lock may lock it again,
//! which is what lets a side effect submit a synchronous action without
//! deadlocking. The lock is deliberately manual (`lock`/`unlock` rather than
//! guard-only) because the designated-lane handoff must release the lock on
//! the worker thread, let the lane thread acquire it, and re-acquire it
//! afterwards.
//!
//! Built on `parking_lot::Mutex` + `Condvar` tracking the owning thread and
//! its recursion depth.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A reentrant mutual-exclusion lock.
pub(crate) struct RecursiveMutex {
    state: Mutex<LockState>,
    unlocked: Condvar,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            unlocked: Condvar::new(),
        }
    }

    /// Acquire the lock, blocking until available. Reentrant: the owning
    /// thread acquires immediately, increasing the recursion depth.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.unlocked.wait(&mut state),
            }
        }
    }

    /// Acquire the lock only if it is free or already owned by this thread.
    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one level of the lock.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(me), "unlock from non-owning thread");
        if state.owner != Some(me) {
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.unlocked.notify_one();
        }
    }

    /// Release every level held by this thread, returning the depth
    /// released. Used by the lane handoff, which must let another thread
    /// acquire the lock no matter how deeply this one holds it.
    pub fn unlock_all(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return 0;
        }
        let depth = state.depth;
        state.depth = 0;
        state.owner = None;
        self.unlocked.notify_one();
        depth
    }

    /// Re-acquire the lock at the given recursion depth.
    pub fn lock_many(&self, depth: usize) {
        if depth == 0 {
            return;
        }
        self.lock();
        let mut state = self.state.lock();
        state.depth = depth;
    }

    /// Run `body` with the lock held, releasing it afterwards even on
    /// unwind.
    pub fn with<R>(&self, body: impl FnOnce() -> R) -> R {
        self.lock();
        let _release = Release(self);
        body()
    }
}

struct Release<'a>(&'a RecursiveMutex);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_is_reentrant() {
        let mutex = RecursiveMutex::new();
        mutex.lock();
        mutex.lock();
        assert!(mutex.try_lock());
        mutex.unlock();
        mutex.unlock();
        mutex.unlock();
    }

    #[test]
    fn with_releases_on_return() {
        let mutex = Arc::new(RecursiveMutex::new());
        mutex.with(|| {});

        // Another thread can now acquire it.
        let mutex_clone = Arc::clone(&mutex);
        let acquired = thread::spawn(move || mutex_clone.try_lock()).join().unwrap();
        assert!(acquired);
    }

    #[test]
    fn excludes_other_threads() {
        let mutex = Arc::new(RecursiveMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        mutex.with(|| {
                            // Non-atomic read-modify-write protected by the lock.
                            let value = counter.load(Ordering::Relaxed);
                            counter.store(value + 1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn unlock_all_releases_every_level() {
        let mutex = Arc::new(RecursiveMutex::new());
        mutex.lock();
        mutex.lock();
        mutex.lock();

        let depth = mutex.unlock_all();
        assert_eq!(depth, 3);

        // Another thread can now acquire and release it.
        let mutex_clone = Arc::clone(&mutex);
        thread::spawn(move || {
            mutex_clone.with(|| {});
        })
        .join()
        .unwrap();

        // Restoring the depth leaves the lock balanced for three unlocks.
        mutex.lock_many(depth);
        mutex.unlock();
        mutex.unlock();
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn try_lock_fails_when_contended() {
        let mutex = Arc::new(RecursiveMutex::new());
        mutex.lock();

        let mutex_clone = Arc::clone(&mutex);
        let acquired = thread::spawn(move || mutex_clone.try_lock()).join().unwrap();
        assert!(!acquired);

        mutex.unlock();
    }
}
