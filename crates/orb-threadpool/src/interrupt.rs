//! Explicit interruption of blocked waiters
//!
//! Threads parked in [`ReentrantLock::acquire_interruptibly`] or
//! [`WorkQueue::request_work_interruptibly`] can be woken early from another
//! thread through the [`Interrupter`] they passed in. The interrupted call
//! returns [`ThreadPoolError::Interrupted`] and consumes the interrupt.
//!
//! [`ReentrantLock::acquire_interruptibly`]: crate::ReentrantLock::acquire_interruptibly
//! [`WorkQueue::request_work_interruptibly`]: crate::WorkQueue::request_work_interruptibly
//! [`ThreadPoolError::Interrupted`]: crate::ThreadPoolError::Interrupted

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Mutable state plus the condition variable its waiters block on.
pub(crate) struct Monitor<T> {
    pub(crate) state: Mutex<T>,
    pub(crate) cond: Condvar,
}

impl<T> Monitor<T> {
    pub(crate) fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }
}

/// Something an interrupter can wake.
pub(crate) trait Wake: Send + Sync {
    fn wake_all(&self);
}

impl<T: Send> Wake for Monitor<T> {
    fn wake_all(&self) {
        // Taking the lock orders the notify after the waiter has parked.
        let _state = self.state.lock();
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct InterruptState {
    interrupted: AtomicBool,
    parked_on: Mutex<Option<Weak<dyn Wake>>>,
}

/// Handle used to interrupt a thread blocked in an interruptible wait.
///
/// Clones share the same interrupt flag. A worker typically owns one and the
/// pool keeps a clone to wake it on shutdown.
#[derive(Clone, Default)]
pub struct Interrupter {
    inner: Arc<InterruptState>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interrupt flag and wake the monitor the owner is parked on.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        let target = self.inner.parked_on.lock().as_ref().and_then(Weak::upgrade);
        if let Some(monitor) = target {
            monitor.wake_all();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Record the monitor the owner is about to wait on.
    ///
    /// Must be called with the monitor's lock held, and the flag checked
    /// afterwards, so an interrupt racing with the park is never lost.
    pub(crate) fn park(&self, monitor: Weak<dyn Wake>) -> Parked<'_> {
        *self.inner.parked_on.lock() = Some(monitor);
        Parked { interrupter: self }
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Unregisters the parked monitor on drop.
pub(crate) struct Parked<'a> {
    interrupter: &'a Interrupter,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        *self.interrupter.inner.parked_on.lock() = None;
    }
}
