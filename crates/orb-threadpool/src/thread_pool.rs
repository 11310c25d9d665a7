//! Elastic pool of worker threads
//!
//! Each worker is homed on one of the pool's [`WorkQueue`]s and parks there,
//! but takes queued work from any queue before it parks. The pool starts with
//! `min_threads` workers, grows one worker at a time while work is queued and
//! no worker is idle, and never exceeds `max_threads`; past that point work
//! simply waits in the queue. A worker idle for `idle_timeout` exits if the
//! pool is above its minimum.

use crate::error::{Result, ThreadPoolError};
use crate::work::Work;
use crate::work_queue::{average, WorkQueue, WorkQueueStats, WorkerWait};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Default idle timeout for surplus workers
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Thread pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    pub name: String,
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout: Duration,
    /// Number of work queues owned by the pool
    pub queues: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            name: "orb-pool".to_string(),
            min_threads: 1,
            max_threads: 32,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            queues: 1,
        }
    }
}

impl ThreadPoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn threads(mut self, min: usize, max: usize) -> Self {
        self.min_threads = min;
        self.max_threads = max;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn queues(mut self, queues: usize) -> Self {
        self.queues = queues;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(ThreadPoolError::InvalidConfig(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.queues == 0 {
            return Err(ThreadPoolError::InvalidConfig(
                "a pool needs at least one work queue".to_string(),
            ));
        }
        Ok(())
    }
}

struct PoolState {
    current_threads: usize,
    next_worker_id: u64,
    closed: bool,
    workers: HashMap<u64, JoinHandle<()>>,
}

pub(crate) struct PoolShared {
    config: ThreadPoolConfig,
    queues: Vec<Arc<WorkQueue>>,
    state: Mutex<PoolState>,
    self_ref: Weak<PoolShared>,
    next_queue: AtomicUsize,
    busy: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    total_completion_nanos: AtomicU64,
}

impl PoolShared {
    /// Called by a queue when it holds more items than idle workers.
    ///
    /// At `max_threads` no worker can be added, so idle workers homed on the
    /// other queues are asked to pick the item up instead.
    pub(crate) fn work_available(&self, queue_id: usize) {
        if self.spawn_worker(queue_id) {
            return;
        }
        trace!(pool = %self.config.name, queue_id, "no worker spawned, asking other queues' workers");
        for queue in self.queues.iter().filter(|q| q.id() != queue_id) {
            queue.request_scan();
        }
    }

    /// Take queued work from any queue, starting with the worker's own.
    fn next_queued_work(&self, home: usize) -> Option<Box<dyn Work>> {
        let count = self.queues.len();
        (0..count).find_map(|offset| self.queues[(home + offset) % count].try_take())
    }

    fn spawn_worker(&self, queue_id: usize) -> bool {
        let Some(queue) = self.queues.get(queue_id).cloned() else {
            return false;
        };
        let mut state = self.state.lock();
        if state.closed || state.current_threads >= self.config.max_threads {
            return false;
        }

        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;
        let pool = self.self_ref.clone();
        let idle_timeout = self.config.idle_timeout;
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.config.name, worker_id))
            .spawn(move || run_worker(pool, queue, worker_id, idle_timeout));

        match spawned {
            Ok(handle) => {
                state.current_threads += 1;
                state.workers.insert(worker_id, handle);
                debug!(
                    pool = %self.config.name,
                    worker_id,
                    current_threads = state.current_threads,
                    "worker spawned"
                );
                true
            }
            Err(e) => {
                error!(pool = %self.config.name, "failed to spawn worker: {}", e);
                false
            }
        }
    }

    /// Decide whether a worker leaves. Surplus workers leave on idle timeout;
    /// every worker leaves once the pool is closed.
    fn retire(&self, worker_id: u64, idle: bool) -> bool {
        let mut state = self.state.lock();
        if idle && !state.closed && state.current_threads <= self.config.min_threads {
            return false;
        }
        // Work queued after the wait timed out may have been refused a new
        // worker while this one still counted. add_work queues before it asks
        // for a worker, so this check under the pool lock cannot miss it.
        if idle && !state.closed && self.queues.iter().any(|q| q.has_work()) {
            return false;
        }
        state.current_threads = state.current_threads.saturating_sub(1);
        // Dropping our own handle detaches it; close() may already hold it.
        state.workers.remove(&worker_id);
        debug!(
            pool = %self.config.name,
            worker_id,
            current_threads = state.current_threads,
            "worker exiting"
        );
        true
    }

    fn execute(&self, work: Box<dyn Work>) {
        let name = work.name().to_string();
        self.busy.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || work.do_work()));
        let elapsed = start.elapsed();
        self.busy.fetch_sub(1, Ordering::Relaxed);

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_completion_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if outcome.is_err() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            error!(pool = %self.config.name, work = %name, "work item panicked");
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.close();
        }
    }
}

fn run_worker(pool: Weak<PoolShared>, home: Arc<WorkQueue>, worker_id: u64, idle_timeout: Duration) {
    loop {
        // not held while parked: dropping the last pool handle closes the queues
        {
            let Some(shared) = pool.upgrade() else {
                break;
            };
            if let Some(work) = shared.next_queued_work(home.id()) {
                shared.execute(work);
                continue;
            }
        }

        let next = home.wait_as_worker(idle_timeout);
        let Some(shared) = pool.upgrade() else {
            break;
        };
        match next {
            WorkerWait::Work(work) => shared.execute(work),
            WorkerWait::Rescan => {}
            WorkerWait::TimedOut => {
                if shared.retire(worker_id, true) {
                    break;
                }
            }
            WorkerWait::Closed => {
                shared.retire(worker_id, false);
                break;
            }
        }
    }
}

/// Handle to a thread pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Create a pool and start its minimum number of workers.
    pub fn new(config: ThreadPoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new_cyclic(|weak: &Weak<PoolShared>| PoolShared {
            queues: (0..config.queues)
                .map(|id| {
                    Arc::new(WorkQueue::for_pool(
                        id,
                        format!("{}-queue-{}", config.name, id),
                        weak.clone(),
                    ))
                })
                .collect(),
            state: Mutex::new(PoolState {
                current_threads: 0,
                next_worker_id: 0,
                closed: false,
                workers: HashMap::new(),
            }),
            self_ref: weak.clone(),
            next_queue: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_completion_nanos: AtomicU64::new(0),
            config,
        });

        for i in 0..shared.config.min_threads {
            shared.spawn_worker(i % shared.queues.len());
        }
        info!(
            pool = %shared.config.name,
            min = shared.config.min_threads,
            max = shared.config.max_threads,
            queues = shared.queues.len(),
            "thread pool started"
        );
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.shared.config
    }

    /// A queue of this pool; rotates across queues when there are several.
    pub fn get_any_work_queue(&self) -> Arc<WorkQueue> {
        let queues = &self.shared.queues;
        let index = self.shared.next_queue.fetch_add(1, Ordering::Relaxed) % queues.len();
        Arc::clone(&queues[index])
    }

    pub fn get_work_queue(&self, id: usize) -> Result<Arc<WorkQueue>> {
        self.shared
            .queues
            .get(id)
            .cloned()
            .ok_or(ThreadPoolError::NoSuchWorkQueue(id))
    }

    pub fn number_of_work_queues(&self) -> usize {
        self.shared.queues.len()
    }

    /// Convenience for `get_any_work_queue().add_work(work)`.
    pub fn add_work(&self, work: Box<dyn Work>) -> Result<()> {
        self.get_any_work_queue().add_work(work)
    }

    /// Stop accepting work, let running items finish and join every worker.
    ///
    /// Work still queued is dropped. Idempotent.
    pub fn close(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.workers.drain().map(|(_, handle)| handle).collect()
        };

        let dropped: usize = self.shared.queues.iter().map(|q| q.close()).sum();
        if dropped > 0 {
            warn!(pool = %self.name(), dropped, "dropped queued work on close");
        }

        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name(), "worker thread panicked");
            }
        }
        info!(pool = %self.name(), "thread pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn current_number_of_threads(&self) -> usize {
        self.shared.state.lock().current_threads
    }

    /// Workers not currently executing work. Best effort.
    pub fn number_of_available_threads(&self) -> usize {
        self.current_number_of_threads()
            .saturating_sub(self.number_of_busy_threads())
    }

    /// Workers currently executing work. Best effort.
    pub fn number_of_busy_threads(&self) -> usize {
        self.shared.busy.load(Ordering::Relaxed)
    }

    pub fn current_processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    pub fn average_work_completion_time(&self) -> Duration {
        average(
            Duration::from_nanos(self.shared.total_completion_nanos.load(Ordering::Relaxed)),
            self.current_processed_count(),
        )
    }

    pub fn stats(&self) -> ThreadPoolStats {
        let current_threads = self.current_number_of_threads();
        let busy_threads = self.number_of_busy_threads();
        ThreadPoolStats {
            name: self.name().to_string(),
            current_threads,
            busy_threads,
            available_threads: current_threads.saturating_sub(busy_threads),
            processed_count: self.current_processed_count(),
            failed_count: self.shared.failed.load(Ordering::Relaxed),
            average_work_completion_time: self.average_work_completion_time(),
            queues: self.shared.queues.iter().map(|q| q.stats()).collect(),
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name())
            .field("current_threads", &self.current_number_of_threads())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub name: String,
    pub current_threads: usize,
    pub busy_threads: usize,
    pub available_threads: usize,
    pub processed_count: u64,
    pub failed_count: u64,
    pub average_work_completion_time: Duration,
    pub queues: Vec<WorkQueueStats>,
}

impl ThreadPoolStats {
    /// Named numeric attributes for external monitoring.
    pub fn attributes(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("currentNumberOfThreads", self.current_threads as u64),
            ("numberOfBusyThreads", self.busy_threads as u64),
            ("numberOfAvailableThreads", self.available_threads as u64),
            ("currentProcessedCount", self.processed_count),
            ("failedCount", self.failed_count),
            (
                "averageWorkCompletionTimeMillis",
                self.average_work_completion_time.as_millis() as u64,
            ),
        ]
    }
}
