//! Concurrency primitives for the ORB transport
//!
//! - [`ReentrantLock`]: owner-counted mutex with timed, interruptible and
//!   bulk (hand-off) acquisition
//! - [`WorkQueue`]: FIFO of pending [`Work`] with bounded blocking dequeue
//!   and residency accounting
//! - [`ThreadPool`]: workers pulling from one or more queues, growing
//!   between `min_threads` and `max_threads` and shrinking on idle
//! - [`ThreadPoolManager`]: named pools plus a default pool
//!
//! # Example
//!
//! ```
//! use orb_threadpool::{FnWork, ThreadPool, ThreadPoolConfig};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::new("example").threads(1, 4)).unwrap();
//! let (tx, rx) = mpsc::channel();
//! pool.add_work(Box::new(FnWork::new("hello", move || tx.send(42).unwrap())))
//!     .unwrap();
//! assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
//! pool.close();
//! ```

mod error;
mod interrupt;
mod manager;
mod reentrant_lock;
mod thread_pool;
mod work;
mod work_queue;

pub use error::{Result, ThreadPoolError};
pub use interrupt::Interrupter;
pub use manager::ThreadPoolManager;
pub use reentrant_lock::{ReentrantLock, ReentrantLockGuard};
pub use thread_pool::{ThreadPool, ThreadPoolConfig, ThreadPoolStats, DEFAULT_IDLE_TIMEOUT};
pub use work::{FnWork, Work};
pub use work_queue::{WorkQueue, WorkQueueStats};
