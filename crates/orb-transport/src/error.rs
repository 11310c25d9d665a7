//! Error types for the ORB transport
//!
//! Every error carries a [`CompletionStatus`] telling the caller whether the
//! remote side may have executed the request, which decides if a retry is
//! safe.

use crate::config::ConfigError;
use orb_threadpool::ThreadPoolError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Whether the operation completed before the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Completed,
    NotCompleted,
    Maybe,
}

impl CompletionStatus {
    /// Whether an idempotent operation may be retried.
    pub fn is_retryable(self) -> bool {
        !matches!(self, CompletionStatus::Completed)
    }

    pub fn as_u32(self) -> u32 {
        match self {
            CompletionStatus::Completed => 0,
            CompletionStatus::NotCompleted => 1,
            CompletionStatus::Maybe => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CompletionStatus::Completed),
            1 => Some(CompletionStatus::NotCompleted),
            2 => Some(CompletionStatus::Maybe),
            _ => None,
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompletionStatus::Completed => "COMPLETED_YES",
            CompletionStatus::NotCompleted => "COMPLETED_NO",
            CompletionStatus::Maybe => "COMPLETED_MAYBE",
        };
        f.write_str(name)
    }
}

/// What went wrong
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("failed to listen for {transport} on port {port}: {source}")]
    ListenerInit {
        transport: String,
        port: u16,
        source: Arc<io::Error>,
    },

    #[error("I/O error on connection to {peer}: {source}")]
    Io { peer: String, source: Arc<io::Error> },

    #[error("connection closed")]
    Closed,

    #[error("malformed data: {0}")]
    Format(String),

    #[error("unknown service context id 0x{0:08x}")]
    UnknownServiceContext(u32),

    #[error("no such work queue: {0}")]
    NoSuchWorkQueue(usize),

    #[error("not initialized: {0}")]
    Uninitialized(String),

    #[error("interrupted")]
    Interrupted,

    #[error("communication failure: {0}")]
    CommFailure(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// ORB transport error: an [`ErrorKind`] plus its [`CompletionStatus`].
#[derive(Debug, Clone, Error)]
#[error("{kind} ({completion})")]
pub struct OrbError {
    kind: ErrorKind,
    completion: CompletionStatus,
}

impl OrbError {
    pub fn new(kind: ErrorKind, completion: CompletionStatus) -> Self {
        Self { kind, completion }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn completion(&self) -> CompletionStatus {
        self.completion
    }

    pub fn with_completion(mut self, completion: CompletionStatus) -> Self {
        self.completion = completion;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.completion.is_retryable()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    pub fn timeout(after: Duration) -> Self {
        ErrorKind::Timeout(after).into()
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        ErrorKind::IllegalState(msg.into()).into()
    }

    pub fn format(msg: impl Into<String>) -> Self {
        ErrorKind::Format(msg.into()).into()
    }

    pub fn closed() -> Self {
        ErrorKind::Closed.into()
    }

    pub fn uninitialized(msg: impl Into<String>) -> Self {
        ErrorKind::Uninitialized(msg.into()).into()
    }

    pub fn comm_failure(msg: impl Into<String>, completion: CompletionStatus) -> Self {
        Self::new(ErrorKind::CommFailure(msg.into()), completion)
    }

    pub fn io(peer: impl fmt::Display, source: io::Error) -> Self {
        Self::new(
            ErrorKind::Io {
                peer: peer.to_string(),
                source: Arc::new(source),
            },
            CompletionStatus::Maybe,
        )
    }

    pub fn listener_init(transport: &str, port: u16, source: io::Error) -> Self {
        ErrorKind::ListenerInit {
            transport: transport.to_string(),
            port,
            source: Arc::new(source),
        }
        .into()
    }
}

impl From<ErrorKind> for OrbError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, CompletionStatus::NotCompleted)
    }
}

impl From<ConfigError> for OrbError {
    fn from(err: ConfigError) -> Self {
        ErrorKind::Config(err).into()
    }
}

impl From<io::Error> for OrbError {
    fn from(err: io::Error) -> Self {
        Self::io("unknown peer", err)
    }
}

impl From<ThreadPoolError> for OrbError {
    fn from(err: ThreadPoolError) -> Self {
        let kind = match err {
            ThreadPoolError::Timeout(after) => ErrorKind::Timeout(after),
            ThreadPoolError::Interrupted => ErrorKind::Interrupted,
            ThreadPoolError::NoSuchWorkQueue(id) => ErrorKind::NoSuchWorkQueue(id),
            ThreadPoolError::IllegalState(msg) => ErrorKind::IllegalState(msg),
            other => ErrorKind::IllegalState(other.to_string()),
        };
        kind.into()
    }
}

pub type Result<T> = std::result::Result<T, OrbError>;
