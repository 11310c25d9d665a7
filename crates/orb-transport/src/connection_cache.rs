//! Live connections of a transport manager

use crate::connection::Connection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct CacheState {
    outbound: HashMap<SocketAddr, Arc<Connection>>,
    inbound: HashMap<u64, Arc<Connection>>,
}

/// Tracks inbound and outbound connections and reclaims idle ones once
/// the total passes a high water mark.
pub struct ConnectionCache {
    state: Mutex<CacheState>,
    high_water_mark: usize,
    reclaim_count: usize,
}

/// Point-in-time counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCacheStats {
    pub outbound: usize,
    pub inbound: usize,
    pub busy: usize,
}

impl ConnectionCache {
    pub fn new(high_water_mark: usize, reclaim_count: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            high_water_mark,
            reclaim_count,
        }
    }

    /// A usable outbound connection to `addr`. Dead entries are dropped.
    pub fn get_outbound(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        let mut state = self.state.lock();
        match state.outbound.get(addr) {
            Some(conn) if conn.state().is_open() => Some(conn.clone()),
            Some(_) => {
                state.outbound.remove(addr);
                None
            }
            None => None,
        }
    }

    /// Cache an outbound connection, returning one that was already cached
    /// for `addr` if it is still usable.
    pub fn put_outbound(&self, addr: SocketAddr, conn: Arc<Connection>) -> Arc<Connection> {
        let mut state = self.state.lock();
        if let Some(existing) = state.outbound.get(&addr) {
            if existing.state().is_open() {
                return existing.clone();
            }
        }
        state.outbound.insert(addr, conn.clone());
        conn
    }

    pub fn put_inbound(&self, conn: Arc<Connection>) {
        self.state.lock().inbound.insert(conn.id(), conn);
    }

    pub fn remove(&self, conn: &Connection) {
        let mut state = self.state.lock();
        state.inbound.remove(&conn.id());
        state.outbound.retain(|_, c| c.id() != conn.id());
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.outbound.len() + state.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let state = self.state.lock();
        state
            .outbound
            .values()
            .chain(state.inbound.values())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ConnectionCacheStats {
        let state = self.state.lock();
        ConnectionCacheStats {
            outbound: state.outbound.len(),
            inbound: state.inbound.len(),
            busy: state
                .outbound
                .values()
                .chain(state.inbound.values())
                .filter(|c| c.is_busy())
                .count(),
        }
    }

    /// Drop closed connections, then close up to `reclaim_count` of the
    /// least recently used idle ones if above the high water mark.
    /// Returns how many were closed.
    pub fn reclaim(&self) -> usize {
        let victims: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            state.outbound.retain(|_, c| c.state().is_open());
            state.inbound.retain(|_, c| c.state().is_open());

            let total = state.outbound.len() + state.inbound.len();
            if total <= self.high_water_mark {
                return 0;
            }
            let mut idle: Vec<Arc<Connection>> = state
                .outbound
                .values()
                .chain(state.inbound.values())
                .filter(|c| !c.is_busy())
                .cloned()
                .collect();
            idle.sort_by_key(|c| c.last_used());
            idle.truncate(self.reclaim_count);
            for victim in &idle {
                state.inbound.remove(&victim.id());
                state.outbound.retain(|_, c| c.id() != victim.id());
            }
            debug!(total, high_water_mark = self.high_water_mark, reclaiming = idle.len(), "Reclaiming connections");
            idle
        };
        for victim in &victims {
            victim.close();
        }
        victims.len()
    }

    /// Close and forget every connection.
    pub fn close_all(&self) {
        let all: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            let mut all: Vec<_> = state.outbound.drain().map(|(_, c)| c).collect();
            all.extend(state.inbound.drain().map(|(_, c)| c));
            all
        };
        if !all.is_empty() {
            info!(count = all.len(), "Closing cached connections");
        }
        for conn in all {
            conn.close();
        }
    }
}
