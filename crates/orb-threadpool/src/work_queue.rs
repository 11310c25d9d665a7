//! FIFO work queue with bounded blocking dequeue
//!
//! A queue is normally owned by a [`ThreadPool`](crate::ThreadPool): adding
//! work wakes an idle worker, or asks the pool for a new one when every
//! worker is busy. A standalone queue (see [`WorkQueue::new`]) only stores
//! work for explicit [`request_work`](WorkQueue::request_work) callers.

use crate::error::{Result, ThreadPoolError};
use crate::interrupt::{Interrupter, Monitor, Wake};
use crate::thread_pool::{PoolShared, ThreadPool};
use crate::work::Work;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// How a pool worker's wait on its home queue ended
pub(crate) enum WorkerWait {
    Work(Box<dyn Work>),
    Rescan,
    TimedOut,
    Closed,
}

struct QueuedWork {
    work: Box<dyn Work>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedWork>,
    /// Threads currently blocked in `request_work` or `wait_as_worker`
    waiting: usize,
    /// Pending requests for a worker parked here to look at the other queues
    scan_requests: usize,
    items_dequeued: u64,
    total_time_in_queue: Duration,
    closed: bool,
}

/// A FIFO queue of pending work.
pub struct WorkQueue {
    id: usize,
    name: String,
    monitor: Arc<Monitor<QueueState>>,
    items_added: AtomicU64,
    items_in_queue: AtomicUsize,
    pool: Weak<PoolShared>,
}

impl WorkQueue {
    /// Create a queue that is not attached to any pool.
    pub fn new(name: impl Into<String>) -> Self {
        Self::for_pool(0, name.into(), Weak::new())
    }

    pub(crate) fn for_pool(id: usize, name: String, pool: Weak<PoolShared>) -> Self {
        Self {
            id,
            name,
            monitor: Arc::new(Monitor::new(QueueState::default())),
            items_added: AtomicU64::new(0),
            items_in_queue: AtomicUsize::new(0),
            pool,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool this queue feeds, if it is still alive.
    pub fn thread_pool(&self) -> Option<ThreadPool> {
        self.pool.upgrade().map(ThreadPool::from_shared)
    }

    /// Append work to the tail of the queue.
    ///
    /// Fails with `IllegalState` once the queue (or its pool) is closed.
    pub fn add_work(&self, work: Box<dyn Work>) -> Result<()> {
        let needs_worker = {
            let mut state = self.monitor.state.lock();
            if state.closed {
                return Err(ThreadPoolError::IllegalState(format!(
                    "work queue {} is closed",
                    self.name
                )));
            }
            trace!(queue = %self.name, work = work.name(), "work added");
            state.items.push_back(QueuedWork {
                work,
                enqueued_at: Instant::now(),
            });
            self.items_added.fetch_add(1, Ordering::Relaxed);
            self.items_in_queue.store(state.items.len(), Ordering::Relaxed);
            if state.waiting > 0 {
                self.monitor.cond.notify_one();
            }
            state.items.len() > state.waiting
        };

        if needs_worker {
            if let Some(pool) = self.pool.upgrade() {
                pool.work_available(self.id);
            }
        }
        Ok(())
    }

    /// Remove the head item, waiting up to `wait_time` for one to arrive.
    pub fn request_work(&self, wait_time: Duration) -> Result<Box<dyn Work>> {
        self.wait_for_work(wait_time, None)
    }

    /// Like [`request_work`](Self::request_work), but returns `Interrupted`
    /// if `interrupter` fires first. Counters are unchanged in that case.
    pub fn request_work_interruptibly(
        &self,
        wait_time: Duration,
        interrupter: &Interrupter,
    ) -> Result<Box<dyn Work>> {
        self.wait_for_work(wait_time, Some(interrupter))
    }

    fn wait_for_work(
        &self,
        wait_time: Duration,
        interrupter: Option<&Interrupter>,
    ) -> Result<Box<dyn Work>> {
        if interrupter.is_some_and(Interrupter::clear) {
            return Err(ThreadPoolError::Interrupted);
        }

        let deadline = Instant::now().checked_add(wait_time);
        let mut state = self.monitor.state.lock();
        if let Some(work) = self.take(&mut state) {
            return Ok(work);
        }

        let _parked = interrupter.map(|i| i.park(self.waker()));
        state.waiting += 1;
        let result = loop {
            if state.closed {
                break Err(ThreadPoolError::IllegalState(format!(
                    "work queue {} is closed",
                    self.name
                )));
            }
            if interrupter.is_some_and(Interrupter::clear) {
                // Pass on a notify this thread may have consumed.
                self.monitor.cond.notify_one();
                break Err(ThreadPoolError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break Err(ThreadPoolError::Timeout(wait_time));
                    }
                    self.monitor.cond.wait_until(&mut state, deadline);
                }
                None => self.monitor.cond.wait(&mut state),
            }
            if let Some(work) = self.take(&mut state) {
                break Ok(work);
            }
        };
        state.waiting -= 1;
        result
    }

    /// Dequeue the head item without blocking.
    pub(crate) fn try_take(&self) -> Option<Box<dyn Work>> {
        let mut state = self.monitor.state.lock();
        self.take(&mut state)
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.monitor.state.lock().items.is_empty()
    }

    /// Wait on behalf of a pool worker whose home is this queue.
    ///
    /// Besides work, timeout and close, the wait ends with
    /// [`WorkerWait::Rescan`] when another queue of the pool asked for help
    /// through [`request_scan`](Self::request_scan).
    pub(crate) fn wait_as_worker(&self, wait_time: Duration) -> WorkerWait {
        let deadline = Instant::now().checked_add(wait_time);
        let mut state = self.monitor.state.lock();
        state.waiting += 1;
        let outcome = loop {
            if let Some(work) = self.take(&mut state) {
                break WorkerWait::Work(work);
            }
            if state.closed {
                break WorkerWait::Closed;
            }
            if state.scan_requests > 0 {
                state.scan_requests -= 1;
                break WorkerWait::Rescan;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break WorkerWait::TimedOut;
                    }
                    self.monitor.cond.wait_until(&mut state, deadline);
                }
                None => self.monitor.cond.wait(&mut state),
            }
        };
        state.waiting -= 1;
        outcome
    }

    /// Ask a worker homed on this queue to look for work on the others.
    ///
    /// The request is remembered when no worker is parked yet, so a worker
    /// about to wait here sees it.
    pub(crate) fn request_scan(&self) {
        let mut state = self.monitor.state.lock();
        if state.closed {
            return;
        }
        state.scan_requests = (state.scan_requests + 1).min(state.waiting.max(1));
        if state.waiting > 0 {
            self.monitor.cond.notify_all();
        }
    }

    fn take(&self, state: &mut QueueState) -> Option<Box<dyn Work>> {
        let queued = state.items.pop_front()?;
        state.items_dequeued += 1;
        state.total_time_in_queue += queued.enqueued_at.elapsed();
        self.items_in_queue.store(state.items.len(), Ordering::Relaxed);
        Some(queued.work)
    }

    /// Reject further work, wake every waiter and drop pending items.
    /// Returns the number of items dropped.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.monitor.state.lock();
        state.closed = true;
        let dropped = state.items.len();
        state.items.clear();
        self.items_in_queue.store(0, Ordering::Relaxed);
        self.monitor.cond.notify_all();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.monitor.state.lock().closed
    }

    /// Items currently waiting. Lock-free and possibly stale.
    pub fn work_items_in_queue(&self) -> usize {
        self.items_in_queue.load(Ordering::Relaxed)
    }

    /// Items ever added. Lock-free and possibly stale.
    pub fn total_work_items_added(&self) -> u64 {
        self.items_added.load(Ordering::Relaxed)
    }

    pub fn total_work_items_dequeued(&self) -> u64 {
        self.monitor.state.lock().items_dequeued
    }

    /// Mean time an item spent queued before being dequeued.
    pub fn average_time_in_queue(&self) -> Duration {
        let state = self.monitor.state.lock();
        average(state.total_time_in_queue, state.items_dequeued)
    }

    pub fn stats(&self) -> WorkQueueStats {
        let state = self.monitor.state.lock();
        WorkQueueStats {
            name: self.name.clone(),
            items_added: self.items_added.load(Ordering::Relaxed),
            items_in_queue: state.items.len(),
            items_dequeued: state.items_dequeued,
            average_time_in_queue: average(state.total_time_in_queue, state.items_dequeued),
        }
    }

    fn waker(&self) -> Weak<dyn Wake> {
        Arc::downgrade(&self.monitor) as Weak<dyn Wake>
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("items_in_queue", &self.work_items_in_queue())
            .finish()
    }
}

pub(crate) fn average(total: Duration, count: u64) -> Duration {
    let count = count.max(1);
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Snapshot of queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueStats {
    pub name: String,
    pub items_added: u64,
    pub items_in_queue: usize,
    pub items_dequeued: u64,
    pub average_time_in_queue: Duration,
}

impl WorkQueueStats {
    /// Named numeric attributes for external monitoring.
    pub fn attributes(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("totalWorkItemsAdded", self.items_added),
            ("workItemsInQueue", self.items_in_queue as u64),
            ("totalWorkItemsDequeued", self.items_dequeued),
            (
                "averageTimeInQueueMillis",
                self.average_time_in_queue.as_millis() as u64,
            ),
        ]
    }
}
