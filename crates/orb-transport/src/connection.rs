//! Connections
//!
//! A [`Connection`] is one live transport session with a peer ORB. Many
//! requests share it: each gets a fresh request id, and the reader side
//! routes every reply to the waiter registered under that id.
//!
//! State only moves forward:
//!
//! ```text
//! OPENING -> ESTABLISHED -> CLOSE_SENT -> CLOSE_RECEIVED
//!     \____________\______________\____________\-> ABORT
//! ```
//!
//! Outbound connections start ESTABLISHED. Inbound connections start
//! OPENING and become ESTABLISHED when the first valid message arrives.

use crate::channel::Channel;
use crate::config::OrbConfig;
use crate::error::{CompletionStatus, ErrorKind, OrbError, Result};
use crate::giop_version::GiopVersion;
use crate::message::{
    Message, MessageHeader, ReplyMessage, ReplyStatus, RequestMessage, HEADER_SIZE,
};
use crate::orb_version::{LegacyPeerPolicy, OrbVersion};
use crate::service_context::{
    CodeSetServiceContext, MaxStreamFormatVersionServiceContext, OrbVersionServiceContext,
    SendingContextRunTime, ServiceContextRegistry, ServiceContexts,
};
use crate::waiting_room::{PendingReply, ResponseWaitingRoom};
use bytes::Bytes;
use orb_threadpool::{ReentrantLock, ThreadPool, Work};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Highest value-type stream format version we understand
const MAX_STREAM_FORMAT_VERSION: u8 = 2;

/// How long a pooled reader waits for a message to start before it hands
/// its worker back to the pool
const POOLED_READ_SLICE: Duration = Duration::from_millis(10);

/// Result of one attempt to read an inbound message
enum ReadOutcome {
    Message(Message),
    /// Nothing arrived within the wait; the connection is still usable
    Quiet,
    Done,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Opening,
    Established,
    CloseSent,
    CloseReceived,
    Abort,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Opening => 0,
            ConnectionState::Established => 1,
            ConnectionState::CloseSent => 2,
            ConnectionState::CloseReceived => 3,
            ConnectionState::Abort => 4,
        }
    }

    /// Transitions only move forward; ABORT is reachable from every other
    /// state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::CloseReceived | ConnectionState::Abort)
    }

    /// Whether new requests and replies may be written.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Opening | ConnectionState::Established)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Opening => "OPENING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::CloseSent => "CLOSE_SENT",
            ConnectionState::CloseReceived => "CLOSE_RECEIVED",
            ConnectionState::Abort => "ABORT",
        };
        f.write_str(name)
    }
}

/// Which thread reads inbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderMode {
    /// Pooled for event-driven channels, dedicated otherwise
    Auto,
    /// One reader thread per connection; requests go to the pool
    Dedicated,
    /// Reading is itself pool work; requests run on the reading worker
    Pooled,
}

impl ReaderMode {
    fn resolve(self, channel: &dyn Channel) -> ReaderMode {
        match self {
            ReaderMode::Auto if channel.is_event_driven() => ReaderMode::Pooled,
            ReaderMode::Auto => ReaderMode::Dedicated,
            other => other,
        }
    }
}

impl FromStr for ReaderMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ReaderMode::Auto),
            "dedicated" => Ok(ReaderMode::Dedicated),
            "pooled" => Ok(ReaderMode::Pooled),
            other => Err(format!(
                "unknown reader mode {:?} (expected auto, dedicated or pooled)",
                other
            )),
        }
    }
}

impl fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderMode::Auto => "auto",
            ReaderMode::Dedicated => "dedicated",
            ReaderMode::Pooled => "pooled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We opened it
    Client,
    /// An acceptor accepted it
    Server,
}

/// Per-connection settings, derived from [`OrbConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub giop_version: GiopVersion,
    pub orb_version: OrbVersion,
    pub read_timeout: Duration,
    pub max_message_size: u32,
    pub reader_mode: ReaderMode,
    pub code_sets: CodeSetServiceContext,
    pub codebase: Option<String>,
    pub legacy_policy: LegacyPeerPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        OrbConfig::default().connection_config()
    }
}

/// The peer's code base, used to fetch implementations of value types
pub trait CodeBase: Send + Sync {
    /// Location of the implementation for `repository_id`.
    fn implementation(&self, repository_id: &str) -> Option<String>;
}

/// Turns a stringified code base reference into a usable [`CodeBase`].
pub trait CodeBaseResolver: Send + Sync {
    fn resolve(&self, codebase_ior: &str) -> Result<Arc<dyn CodeBase>>;
}

/// What a dispatcher produced for a request
#[derive(Debug, Clone)]
pub struct Response {
    pub status: ReplyStatus,
    pub service_contexts: ServiceContexts,
    pub body: Bytes,
}

impl Response {
    pub fn ok(body: Bytes) -> Self {
        Self {
            status: ReplyStatus::NoException,
            service_contexts: ServiceContexts::new(),
            body,
        }
    }

    pub fn system_exception(message: &str) -> Self {
        Self {
            status: ReplyStatus::SystemException,
            service_contexts: ServiceContexts::new(),
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }
}

/// Executes inbound requests. Runs on a pool worker.
pub trait RequestDispatcher: Send + Sync {
    fn dispatch(&self, connection: &Arc<Connection>, request: &RequestMessage) -> Response;
}

/// Where inbound work runs
pub struct InboundContext {
    pub pool: ThreadPool,
    /// `None` answers every request with a system exception
    pub dispatcher: Option<Arc<dyn RequestDispatcher>>,
}

impl InboundContext {
    pub fn new(pool: ThreadPool, dispatcher: Option<Arc<dyn RequestDispatcher>>) -> Self {
        Self { pool, dispatcher }
    }
}

/// A live transport session with a peer
pub struct Connection {
    id: u64,
    role: ConnectionRole,
    peer: String,
    channel: Arc<dyn Channel>,
    config: ConnectionConfig,
    registry: Arc<ServiceContextRegistry>,
    reader_mode: ReaderMode,
    state: Mutex<ConnectionState>,
    next_request_id: AtomicU32,
    waiting_room: ResponseWaitingRoom,
    read_lock: Mutex<()>,
    /// Orders outbound messages; reentrant so `close` can hold it across
    /// its CloseConnection write
    write_lock: ReentrantLock,
    giop_version: Mutex<Option<GiopVersion>>,
    code_set: Mutex<Option<CodeSetServiceContext>>,
    first_request_sent: AtomicBool,
    peer_orb_version: Mutex<Option<OrbVersion>>,
    code_base_ior: Mutex<Option<String>>,
    code_base: Mutex<Option<Arc<dyn CodeBase>>>,
    cancelled: Mutex<HashSet<u32>>,
    active_dispatches: AtomicUsize,
    reader_started: AtomicBool,
    last_used: Mutex<Instant>,
}

impl Connection {
    pub fn new(
        channel: Arc<dyn Channel>,
        role: ConnectionRole,
        config: ConnectionConfig,
        registry: Arc<ServiceContextRegistry>,
    ) -> Arc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let peer = channel
            .peer_addr()
            .map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
        let reader_mode = config.reader_mode.resolve(channel.as_ref());
        let state = match role {
            ConnectionRole::Client => ConnectionState::Established,
            ConnectionRole::Server => ConnectionState::Opening,
        };
        debug!(conn = id, %peer, ?role, %reader_mode, "Connection created");
        Arc::new(Self {
            id,
            role,
            peer,
            channel,
            config,
            registry,
            reader_mode,
            state: Mutex::new(state),
            next_request_id: AtomicU32::new(1),
            waiting_room: ResponseWaitingRoom::new(),
            read_lock: Mutex::new(()),
            write_lock: ReentrantLock::new(),
            giop_version: Mutex::new(None),
            code_set: Mutex::new(None),
            first_request_sent: AtomicBool::new(false),
            peer_orb_version: Mutex::new(None),
            code_base_ior: Mutex::new(None),
            code_base: Mutex::new(None),
            cancelled: Mutex::new(HashSet::new()),
            active_dispatches: AtomicUsize::new(0),
            reader_started: AtomicBool::new(false),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn reader_mode(&self) -> ReaderMode {
        self.reader_mode
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Move to `next` if that is a forward transition.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        debug!(conn = self.id, from = %*state, to = %next, "Connection state change");
        *state = next;
        true
    }

    /// A fresh request id. Once the counter wraps, ids whose replies are
    /// still awaited are skipped.
    pub fn get_next_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            if !self.waiting_room.is_waiting(id) {
                return id;
            }
            debug!(conn = self.id, request_id = id, "Skipping request id still in use");
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Whether requests are outstanding in either direction.
    pub fn is_busy(&self) -> bool {
        self.waiting_room.pending_count() > 0 || self.active_dispatches.load(Ordering::SeqCst) > 0
    }

    pub fn pending_request_count(&self) -> usize {
        self.waiting_room.pending_count()
    }

    /// Negotiated version, or the configured one before negotiation.
    pub fn giop_version(&self) -> GiopVersion {
        self.giop_version.lock().unwrap_or(self.config.giop_version)
    }

    pub fn set_giop_version(&self, version: GiopVersion) {
        *self.giop_version.lock() = Some(version);
    }

    /// The version a fresh negotiation with this peer would pick.
    pub fn preferred_request_version(
        &self,
        peer_version: GiopVersion,
        peer_orb: Option<OrbVersion>,
    ) -> GiopVersion {
        self.config.legacy_policy.choose_request_version(
            self.config.giop_version,
            peer_version,
            peer_orb,
        )
    }

    /// Pick the request version for this connection's peer and remember it.
    pub fn negotiate_request_version(
        &self,
        peer_version: GiopVersion,
        peer_orb: Option<OrbVersion>,
    ) -> GiopVersion {
        let chosen = self.preferred_request_version(peer_version, peer_orb);
        if peer_orb.is_some() {
            *self.peer_orb_version.lock() = peer_orb;
        }
        self.set_giop_version(chosen);
        debug!(conn = self.id, %peer_version, %chosen, "Negotiated GIOP version");
        chosen
    }

    pub fn peer_orb_version(&self) -> Option<OrbVersion> {
        *self.peer_orb_version.lock()
    }

    /// Code sets in use, once the first request carried them.
    pub fn code_set(&self) -> Option<CodeSetServiceContext> {
        *self.code_set.lock()
    }

    pub fn set_code_base_ior(&self, ior: impl Into<String>) {
        *self.code_base_ior.lock() = Some(ior.into());
        self.code_base.lock().take();
    }

    pub fn code_base_ior(&self) -> Option<String> {
        self.code_base_ior.lock().clone()
    }

    /// The peer's code base, resolved on first use and cached.
    ///
    /// The resolver runs without any connection lock held.
    pub fn get_code_base(&self, resolver: &dyn CodeBaseResolver) -> Result<Option<Arc<dyn CodeBase>>> {
        if let Some(code_base) = self.code_base.lock().clone() {
            return Ok(Some(code_base));
        }
        let Some(ior) = self.code_base_ior() else {
            return Ok(None);
        };
        let resolved = resolver.resolve(&ior)?;
        debug!(conn = self.id, "Resolved peer code base");

        let mut cached = self.code_base.lock();
        if self.code_base_ior().as_deref() != Some(ior.as_str()) {
            // the IOR changed while resolving; do not cache the old one
            return Ok(Some(resolved));
        }
        Ok(Some(cached.get_or_insert(resolved).clone()))
    }

    /// Read exactly `length` bytes into `buf[offset..]`, waiting at most
    /// `max_wait` in total.
    ///
    /// A channel failure aborts the connection and purges every pending
    /// request.
    pub fn read(&self, buf: &mut [u8], offset: usize, length: usize, max_wait: Duration) -> Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                OrbError::illegal_state(format!(
                    "read of {} bytes at offset {} overruns a {} byte buffer",
                    length,
                    offset,
                    buf.len()
                ))
            })?;
        let _guard = self.read_lock.lock();
        self.read_fully(&mut buf[offset..end], Some(max_wait))
    }

    fn read_fully(&self, dst: &mut [u8], max_wait: Option<Duration>) -> Result<()> {
        let deadline = max_wait.and_then(|wait| Instant::now().checked_add(wait));
        let mut filled = 0;
        while filled < dst.len() {
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(OrbError::timeout(max_wait.unwrap_or_default()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match self.channel.read(&mut dst[filled..], timeout) {
                Ok(0) => return Err(self.fail(io::Error::from(io::ErrorKind::UnexpectedEof))),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        self.touch();
        Ok(())
    }

    /// Write all of `buf`. A channel failure aborts the connection.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !self.state().is_open() {
            return Err(OrbError::closed());
        }
        self.channel.write_all(buf).map_err(|e| self.fail(e))?;
        self.touch();
        Ok(())
    }

    /// Map a channel error, tearing the connection down if it was open.
    fn fail(&self, err: io::Error) -> OrbError {
        if !self.state().is_open() {
            return OrbError::closed().with_completion(CompletionStatus::Maybe);
        }
        let error = OrbError::io(&self.peer, err);
        warn!(conn = self.id, peer = %self.peer, error = %error, "Connection failed");
        self.purge_calls(
            &OrbError::comm_failure(
                format!("connection to {} failed", self.peer),
                CompletionStatus::Maybe,
            ),
            true,
        );
        error
    }

    /// Register interest in the reply to `request_id`.
    pub fn response_waiting_room_register(&self, request_id: u32) -> Result<PendingReply> {
        if !self.state().is_open() {
            return Err(OrbError::closed());
        }
        self.waiting_room.register(request_id)
    }

    /// Route a reply to its waiter. Returns false when nobody waits for it.
    pub fn deliver_reply(&self, reply: ReplyMessage) -> bool {
        self.waiting_room.deliver(reply)
    }

    /// Fail every outstanding request with `error`.
    ///
    /// With `force_abort` the connection also moves to ABORT, its channel
    /// is shut down and later registrations are refused.
    pub fn purge_calls(&self, error: &OrbError, force_abort: bool) -> usize {
        let purged = if force_abort {
            if self.transition(ConnectionState::Abort) {
                self.channel.shutdown();
            }
            self.waiting_room.close(error)
        } else {
            self.waiting_room.purge(error)
        };
        if purged > 0 {
            info!(conn = self.id, purged, force_abort, error = %error, "Purged pending requests");
        }
        purged
    }

    /// Abort with a communication failure.
    pub fn abort(&self, reason: &str) {
        self.purge_calls(
            &OrbError::comm_failure(reason.to_string(), CompletionStatus::Maybe),
            true,
        );
    }

    /// Say goodbye to the peer, fail pending requests and shut the
    /// channel. Pending requests were never processed by the peer.
    pub fn close(&self) {
        {
            // nothing may be written after CloseConnection
            let _writes = self.write_lock.lock();
            if self.state().is_open() {
                if let Err(e) = self.send_close_connection() {
                    debug!(conn = self.id, error = %e, "CloseConnection not sent");
                }
                self.transition(ConnectionState::CloseSent);
            }
        }
        self.waiting_room.close(&OrbError::comm_failure(
            "connection closed",
            CompletionStatus::NotCompleted,
        ));
        self.channel.shutdown();
        info!(conn = self.id, peer = %self.peer, "Connection closed");
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        self.write(&message.encode(self.giop_version()))
    }

    /// Best effort: callers tear down regardless of the outcome.
    pub fn send_close_connection(&self) -> Result<()> {
        self.send_message(&Message::CloseConnection)
    }

    /// Best effort: the reply may already be on its way.
    pub fn send_cancel_request(&self, request_id: u32) -> Result<()> {
        self.send_message(&Message::CancelRequest { request_id })
    }

    fn send_message_error(&self) -> Result<()> {
        self.send_message(&Message::MessageError)
    }

    pub fn send_reply(&self, reply: ReplyMessage) -> Result<()> {
        self.send_message(&Message::Reply(reply))
    }

    /// Contexts for an outgoing request. The first request of a
    /// connection also carries our code sets and code base.
    fn request_service_contexts(&self) -> ServiceContexts {
        let mut contexts = ServiceContexts::new();
        contexts.put(Arc::new(OrbVersionServiceContext::new(self.config.orb_version)));
        if !self.first_request_sent.swap(true, Ordering::SeqCst) {
            contexts.put(Arc::new(self.config.code_sets));
            contexts.put(Arc::new(MaxStreamFormatVersionServiceContext::new(
                MAX_STREAM_FORMAT_VERSION,
            )));
            if let Some(codebase) = &self.config.codebase {
                contexts.put(Arc::new(SendingContextRunTime::new(codebase.clone())));
            }
            *self.code_set.lock() = Some(self.config.code_sets);
        }
        contexts
    }

    /// Send a request and, if a response is expected, wait up to
    /// `timeout` for it.
    ///
    /// On timeout a CancelRequest is sent and the error carries
    /// [`CompletionStatus::Maybe`].
    pub fn send_request(
        &self,
        operation: &str,
        body: Bytes,
        response_expected: bool,
        timeout: Duration,
    ) -> Result<Option<ReplyMessage>> {
        if !self.state().is_open() {
            return Err(OrbError::closed());
        }
        let request_id = self.get_next_request_id();
        let pending = if response_expected {
            Some(self.response_waiting_room_register(request_id)?)
        } else {
            None
        };
        let message = Message::Request(RequestMessage {
            request_id,
            response_expected,
            service_contexts: self.request_service_contexts(),
            operation: operation.to_string(),
            body,
        });
        self.send_message(&message)?;

        let Some(pending) = pending else {
            return Ok(None);
        };
        match pending.wait(timeout) {
            Err(e) if e.is_timeout() => {
                if let Err(cancel_err) = self.send_cancel_request(request_id) {
                    debug!(conn = self.id, request_id, error = %cancel_err, "CancelRequest not sent");
                }
                Err(e.with_completion(CompletionStatus::Maybe))
            }
            other => other.map(Some),
        }
    }

    /// Read one complete message.
    ///
    /// With `idle_wait`, gives up with `Ok(None)` when no byte of a new
    /// message arrives in time; once a message has started, the rest must
    /// arrive within the read timeout.
    fn read_message(&self, idle_wait: Option<Duration>) -> Result<Option<Message>> {
        let (header, body) = {
            let _guard = self.read_lock.lock();
            let mut raw = [0u8; HEADER_SIZE];
            match idle_wait {
                Some(wait) => {
                    let started = self.read_message_start(&mut raw, wait)?;
                    if started == 0 {
                        return Ok(None);
                    }
                    self.read_fully(&mut raw[started..], Some(self.config.read_timeout))?;
                }
                None => self.read_fully(&mut raw, None)?,
            }
            let header = MessageHeader::decode(&raw)?;
            if header.version > self.config.giop_version {
                return Err(OrbError::format(format!(
                    "peer sent GIOP {} but only up to {} is supported",
                    header.version, self.config.giop_version
                )));
            }
            if header.body_size > self.config.max_message_size {
                return Err(OrbError::format(format!(
                    "message body of {} bytes exceeds the {} byte limit",
                    header.body_size, self.config.max_message_size
                )));
            }
            let mut body = vec![0u8; header.body_size as usize];
            self.read_fully(&mut body, Some(self.config.read_timeout))?;
            (header, Bytes::from(body))
        };

        let message = Message::decode_body(&header, body, &self.registry)?;
        if self.transition(ConnectionState::Established) {
            info!(conn = self.id, peer = %self.peer, version = %header.version, "Connection established");
        }
        if matches!(message, Message::Request(_)) {
            let mut version = self.giop_version.lock();
            if version.is_none() {
                *version = Some(header.version);
            }
        }
        Ok(Some(message))
    }

    /// Header bytes that arrive within `wait`, 0 if the peer stayed quiet.
    fn read_message_start(&self, raw: &mut [u8], wait: Duration) -> Result<usize> {
        match self.channel.read(raw, Some(wait)) {
            Ok(0) => Err(self.fail(io::Error::from(io::ErrorKind::UnexpectedEof))),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Next inbound message. Failures tear the connection down and end
    /// the reader.
    fn next_message(&self, idle_wait: Option<Duration>) -> ReadOutcome {
        match self.read_message(idle_wait) {
            Ok(Some(message)) => ReadOutcome::Message(message),
            Ok(None) if self.state().is_open() => ReadOutcome::Quiet,
            Ok(None) => ReadOutcome::Done,
            Err(e) => {
                if self.state().is_open() {
                    if matches!(e.kind(), ErrorKind::Format(_)) {
                        warn!(conn = self.id, peer = %self.peer, error = %e, "Malformed message");
                        if let Err(send_err) = self.send_message_error() {
                            debug!(conn = self.id, error = %send_err, "MessageError not sent");
                        }
                    }
                    self.purge_calls(
                        &OrbError::comm_failure(
                            format!("reading from {} failed: {}", self.peer, e),
                            CompletionStatus::Maybe,
                        ),
                        true,
                    );
                } else {
                    debug!(conn = self.id, state = %self.state(), "Reader stopping");
                }
                ReadOutcome::Done
            }
        }
    }

    /// Start servicing inbound messages. Idempotent.
    pub fn start_reader(self: &Arc<Self>, ctx: Arc<InboundContext>) -> Result<()> {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.reader_mode {
            ReaderMode::Pooled => {
                ctx.pool.add_work(Box::new(ReaderWork {
                    connection: self.clone(),
                    ctx: ctx.clone(),
                }))?;
            }
            ReaderMode::Dedicated | ReaderMode::Auto => {
                let connection = self.clone();
                thread::Builder::new()
                    .name(format!("orb-reader-{}", self.id))
                    .spawn(move || connection.run_reader(&ctx))
                    .map_err(|e| OrbError::io(&self.peer, e))?;
            }
        }
        Ok(())
    }

    fn run_reader(self: &Arc<Self>, ctx: &Arc<InboundContext>) {
        debug!(conn = self.id, "Reader thread started");
        loop {
            match self.next_message(None) {
                ReadOutcome::Message(message) => self.handle_message(message, ctx, false),
                ReadOutcome::Quiet => {}
                ReadOutcome::Done => break,
            }
        }
        debug!(conn = self.id, "Reader thread exiting");
    }

    fn record_request_contexts(&self, contexts: &ServiceContexts) {
        if let Some(code_set) = contexts.get_as::<CodeSetServiceContext>(CodeSetServiceContext::ID) {
            let mut current = self.code_set.lock();
            if current.is_none() {
                debug!(conn = self.id, char_data = code_set.char_data(), wchar_data = code_set.wchar_data(), "Peer chose code sets");
                *current = Some(*code_set);
            }
        }
        if let Some(runtime) = contexts.get_as::<SendingContextRunTime>(SendingContextRunTime::ID) {
            let mut ior = self.code_base_ior.lock();
            if ior.is_none() {
                *ior = Some(runtime.codebase_ior().to_string());
            }
        }
        if let Some(orb) = contexts.get_as::<OrbVersionServiceContext>(OrbVersionServiceContext::ID) {
            *self.peer_orb_version.lock() = Some(orb.version());
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message, ctx: &Arc<InboundContext>, inline: bool) {
        match message {
            Message::Request(request) => {
                self.record_request_contexts(&request.service_contexts);
                let work = RequestWork {
                    connection: self.clone(),
                    ctx: ctx.clone(),
                    request,
                };
                if inline {
                    Box::new(work).do_work();
                } else if let Err(e) = ctx.pool.add_work(Box::new(work)) {
                    warn!(conn = self.id, error = %e, "Cannot queue inbound request");
                    self.purge_calls(
                        &OrbError::comm_failure("thread pool closed", CompletionStatus::NotCompleted),
                        true,
                    );
                }
            }
            Message::Reply(reply) => {
                let request_id = reply.request_id;
                if !self.deliver_reply(reply) {
                    debug!(conn = self.id, request_id, "Discarding reply nobody waits for");
                }
            }
            Message::CancelRequest { request_id } => {
                debug!(conn = self.id, request_id, "Peer cancelled request");
                self.cancelled.lock().insert(request_id);
            }
            Message::CloseConnection => {
                info!(conn = self.id, peer = %self.peer, "Peer closed connection");
                self.transition(ConnectionState::CloseReceived);
                self.waiting_room.close(&OrbError::comm_failure(
                    format!("{} closed the connection", self.peer),
                    CompletionStatus::NotCompleted,
                ));
                self.channel.shutdown();
            }
            Message::MessageError => {
                warn!(conn = self.id, peer = %self.peer, "Peer reported a message error");
                self.purge_calls(
                    &OrbError::comm_failure("peer reported a message error", CompletionStatus::Maybe),
                    true,
                );
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("giop_version", &self.giop_version())
            .field("reader_mode", &self.reader_mode)
            .finish()
    }
}

struct DispatchGuard<'a>(&'a AtomicUsize);

impl<'a> DispatchGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One inbound request, executed on a pool worker
struct RequestWork {
    connection: Arc<Connection>,
    ctx: Arc<InboundContext>,
    request: RequestMessage,
}

impl Work for RequestWork {
    fn do_work(self: Box<Self>) {
        let connection = &self.connection;
        let request_id = self.request.request_id;
        if connection.cancelled.lock().remove(&request_id) {
            debug!(conn = connection.id, request_id, "Skipping cancelled request");
            return;
        }

        let response = {
            let _active = DispatchGuard::enter(&connection.active_dispatches);
            match &self.ctx.dispatcher {
                Some(dispatcher) => dispatcher.dispatch(connection, &self.request),
                None => Response::system_exception("no request dispatcher installed"),
            }
        };

        let cancelled = connection.cancelled.lock().remove(&request_id);
        if !self.request.response_expected || cancelled {
            return;
        }
        let reply = ReplyMessage {
            request_id,
            status: response.status,
            service_contexts: response.service_contexts,
            body: response.body,
        };
        if let Err(e) = connection.send_reply(reply) {
            debug!(conn = connection.id, request_id, error = %e, "Reply not sent");
        }
    }

    fn name(&self) -> &str {
        "inbound-request"
    }
}

/// Waits briefly for one message and requeues itself, so pooled
/// connections share workers with each other and with request work.
/// A message that did arrive is handled in place.
struct ReaderWork {
    connection: Arc<Connection>,
    ctx: Arc<InboundContext>,
}

impl Work for ReaderWork {
    fn do_work(self: Box<Self>) {
        let message = match self.connection.next_message(Some(POOLED_READ_SLICE)) {
            ReadOutcome::Message(message) => Some(message),
            ReadOutcome::Quiet => None,
            ReadOutcome::Done => return,
        };
        let keep_reading = !matches!(message, Some(Message::CloseConnection | Message::MessageError));
        if keep_reading {
            let next = ReaderWork {
                connection: self.connection.clone(),
                ctx: self.ctx.clone(),
            };
            if let Err(e) = self.ctx.pool.add_work(Box::new(next)) {
                warn!(conn = self.connection.id, error = %e, "Cannot requeue connection reader");
                self.connection.abort("thread pool closed");
            }
        }
        if let Some(message) = message {
            self.connection.handle_message(message, &self.ctx, true);
        }
    }

    fn name(&self) -> &str {
        "connection-reader"
    }
}
