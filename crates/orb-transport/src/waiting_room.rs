//! Correlation of outstanding requests with their replies

use crate::error::{OrbError, Result};
use crate::message::ReplyMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct Slot {
    outcome: Mutex<Option<Result<ReplyMessage>>>,
    ready: Condvar,
}

impl Slot {
    fn complete(&self, outcome: Result<ReplyMessage>) {
        let mut guard = self.outcome.lock();
        if guard.is_none() {
            *guard = Some(outcome);
            self.ready.notify_all();
        }
    }
}

#[derive(Default)]
struct RoomState {
    slots: HashMap<u32, Arc<Slot>>,
    /// Set once the room stops accepting registrations
    closed: Option<OrbError>,
}

#[derive(Default)]
struct RoomInner {
    state: Mutex<RoomState>,
}

impl RoomInner {
    fn remove_if_same(&self, request_id: u32, slot: &Arc<Slot>) {
        let mut state = self.state.lock();
        if state
            .slots
            .get(&request_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            state.slots.remove(&request_id);
        }
    }
}

/// Outstanding requests of one connection, keyed by request id.
///
/// Each registered request receives exactly one outcome: its reply, or the
/// error it was purged with.
#[derive(Default)]
pub struct ResponseWaitingRoom {
    inner: Arc<RoomInner>,
}

impl ResponseWaitingRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `request_id`.
    pub fn register(&self, request_id: u32) -> Result<PendingReply> {
        let mut state = self.inner.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        if state.slots.contains_key(&request_id) {
            return Err(OrbError::illegal_state(format!(
                "request id {} is already waiting for a reply",
                request_id
            )));
        }
        let slot = Arc::new(Slot {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        });
        state.slots.insert(request_id, slot.clone());
        Ok(PendingReply {
            request_id,
            slot,
            room: self.inner.clone(),
        })
    }

    /// Hand a reply to its waiter. Returns false when nobody waits for it.
    pub fn deliver(&self, reply: ReplyMessage) -> bool {
        let slot = self.inner.state.lock().slots.remove(&reply.request_id);
        match slot {
            Some(slot) => {
                slot.complete(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `error`.
    pub fn purge(&self, error: &OrbError) -> usize {
        let drained: Vec<Arc<Slot>> = {
            let mut state = self.inner.state.lock();
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.complete(Err(error.clone()));
        }
        drained.len()
    }

    /// Purge, and refuse later registrations with `error`.
    pub fn close(&self, error: &OrbError) -> usize {
        {
            let mut state = self.inner.state.lock();
            if state.closed.is_none() {
                state.closed = Some(error.clone());
            }
        }
        self.purge(error)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_waiting(&self, request_id: u32) -> bool {
        self.inner.state.lock().slots.contains_key(&request_id)
    }
}

/// A registered request awaiting its outcome. Dropping it unregisters
/// the request.
pub struct PendingReply {
    request_id: u32,
    slot: Arc<Slot>,
    room: Arc<RoomInner>,
}

impl PendingReply {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Block until the reply arrives, the request is purged or `timeout`
    /// elapses.
    pub fn wait(self, timeout: Duration) -> Result<ReplyMessage> {
        let deadline = Instant::now().checked_add(timeout);
        let mut outcome = self.slot.outcome.lock();
        while outcome.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.slot.ready.wait_until(&mut outcome, deadline).timed_out() {
                        break;
                    }
                }
                None => self.slot.ready.wait(&mut outcome),
            }
        }
        if let Some(result) = outcome.take() {
            return result;
        }
        drop(outcome);

        // a reply may land between the timeout and unregistering
        self.room.remove_if_same(self.request_id, &self.slot);
        if let Some(result) = self.slot.outcome.lock().take() {
            return result;
        }
        debug!(request_id = self.request_id, ?timeout, "Gave up waiting for reply");
        Err(OrbError::timeout(timeout))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.room.remove_if_same(self.request_id, &self.slot);
    }
}
