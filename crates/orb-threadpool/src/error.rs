//! Error types for the thread pool layer

use std::time::Duration;
use thiserror::Error;

/// Thread pool and synchronization errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadPoolError {
    /// A bounded wait expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The waiting thread was interrupted
    #[error("interrupted while waiting")]
    Interrupted,

    /// Ownership or lifecycle violation by the caller
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("no such work queue: {0}")]
    NoSuchWorkQueue(usize),

    #[error("no such thread pool: {0}")]
    NoSuchThreadPool(String),

    /// Invalid pool configuration
    #[error("invalid thread pool configuration: {0}")]
    InvalidConfig(String),
}

impl ThreadPoolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ThreadPoolError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ThreadPoolError>;
