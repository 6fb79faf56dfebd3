//! Optional traffic feed for diagnostics tooling.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use nexus_shared::SessionId;
use serde::Serialize;

/// Receives connection and byte-count events from the engine.
///
/// All methods default to no-ops; the engine never depends on what an
/// observer does with them.
pub trait TrafficObserver: Send + Sync {
    fn on_connection_opened(&self, _session: SessionId, _peer: SocketAddr) {}
    fn on_connection_closed(&self, _session: SessionId) {}
    fn on_bytes_in(&self, _session: SessionId, _len: usize) {}
    fn on_bytes_out(&self, _session: SessionId, _len: usize) {}
}

pub struct NoopObserver;

impl TrafficObserver for NoopObserver {}

/// Lock-free running totals.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficTotals {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> TrafficTotals {
        TrafficTotals {
            connections_opened: self.opened.load(Ordering::Relaxed),
            connections_closed: self.closed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl TrafficObserver for TrafficCounters {
    fn on_connection_opened(&self, _session: SessionId, _peer: SocketAddr) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection_closed(&self, _session: SessionId) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bytes_in(&self, _session: SessionId, len: usize) {
        self.bytes_in.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn on_bytes_out(&self, _session: SessionId, len: usize) {
        self.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
    }
}
