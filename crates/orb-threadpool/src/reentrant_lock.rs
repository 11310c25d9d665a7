//! Reentrant mutual exclusion built on a monitor
//!
//! The owning thread may acquire the lock any number of times; it becomes
//! available to other threads only after a matching number of releases.
//! Waiting is done on a condition variable, never by spinning.

use crate::error::{Result, ThreadPoolError};
use crate::interrupt::{Interrupter, Monitor, Wake};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Default)]
struct LockState {
    /// `Some` iff `count > 0`
    owner: Option<ThreadId>,
    count: u32,
}

impl LockState {
    fn is_available_to(&self, thread: ThreadId) -> bool {
        match self.owner {
            None => true,
            Some(owner) => owner == thread,
        }
    }

    fn enter(&mut self, thread: ThreadId) {
        self.owner = Some(thread);
        self.count += 1;
    }
}

/// A reentrant mutex with timed, interruptible and bulk acquisition.
pub struct ReentrantLock {
    monitor: Arc<Monitor<LockState>>,
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self {
            monitor: Arc::new(Monitor::new(LockState::default())),
        }
    }

    /// Block until the lock is free or already held by the caller.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.monitor.state.lock();
        while !state.is_available_to(me) {
            self.monitor.cond.wait(&mut state);
        }
        state.enter(me);
    }

    /// Like [`acquire`](Self::acquire), but gives up when `interrupter` fires.
    ///
    /// On interruption the lock state is unchanged and one other waiter is
    /// woken so that a concurrent release is not lost.
    pub fn acquire_interruptibly(&self, interrupter: &Interrupter) -> Result<()> {
        let me = thread::current().id();
        if interrupter.clear() {
            return Err(ThreadPoolError::Interrupted);
        }

        let mut state = self.monitor.state.lock();
        if state.is_available_to(me) {
            state.enter(me);
            return Ok(());
        }

        let _parked = interrupter.park(self.waker());
        loop {
            if interrupter.clear() {
                self.monitor.cond.notify_one();
                return Err(ThreadPoolError::Interrupted);
            }
            self.monitor.cond.wait(&mut state);
            if state.is_available_to(me) {
                state.enter(me);
                return Ok(());
            }
        }
    }

    /// Acquire if possible within `timeout`. Returns `false` on expiry
    /// without touching the lock.
    pub fn attempt(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.monitor.state.lock();
        loop {
            if state.is_available_to(me) {
                state.enter(me);
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    self.monitor.cond.wait_until(&mut state, deadline);
                }
                None => self.monitor.cond.wait(&mut state),
            }
        }
    }

    /// Release one level of ownership.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.monitor.state.lock();
        if state.owner != Some(me) {
            return Err(ThreadPoolError::IllegalState(
                "release() called by a thread that does not hold the lock".to_string(),
            ));
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.monitor.cond.notify_one();
        }
        Ok(())
    }

    /// Wait for the lock to be free, then take it with an explicit hold
    /// count. Used to hand a previously released count back to the caller.
    pub fn acquire_all(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(ThreadPoolError::IllegalState(
                "acquire_all() requires a positive count".to_string(),
            ));
        }
        let me = thread::current().id();
        let mut state = self.monitor.state.lock();
        if state.owner == Some(me) {
            return Err(ThreadPoolError::IllegalState(
                "acquire_all() called by a thread that already holds the lock".to_string(),
            ));
        }
        while state.owner.is_some() {
            self.monitor.cond.wait(&mut state);
        }
        state.owner = Some(me);
        state.count = count;
        trace!(count, "lock acquired with explicit hold count");
        Ok(())
    }

    /// Release every level of ownership at once, returning the count held.
    pub fn release_all(&self) -> Result<u32> {
        let me = thread::current().id();
        let mut state = self.monitor.state.lock();
        if state.owner != Some(me) {
            return Err(ThreadPoolError::IllegalState(
                "release_all() called by a thread that does not hold the lock".to_string(),
            ));
        }
        let count = state.count;
        state.count = 0;
        state.owner = None;
        self.monitor.cond.notify_one();
        Ok(count)
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self) -> ReentrantLockGuard<'_> {
        self.acquire();
        ReentrantLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Number of times the calling thread holds the lock (0 if not owner).
    pub fn hold_count(&self) -> u32 {
        let state = self.monitor.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.count
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.hold_count() > 0
    }

    pub fn is_locked(&self) -> bool {
        self.monitor.state.lock().owner.is_some()
    }

    fn waker(&self) -> Weak<dyn Wake> {
        Arc::downgrade(&self.monitor) as Weak<dyn Wake>
    }
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.monitor.state.lock();
        f.debug_struct("ReentrantLock")
            .field("owner", &state.owner)
            .field("count", &state.count)
            .finish()
    }
}

/// Scoped hold on a [`ReentrantLock`]; must be dropped on the acquiring thread.
pub struct ReentrantLockGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReentrantLockGuard<'_> {
    fn drop(&mut self) {
        let released = self.lock.release();
        debug_assert!(released.is_ok(), "guard dropped by non-owner");
    }
}
