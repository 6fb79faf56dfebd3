//! Process statistics: counters, gauges and value histograms.
//!
//! Recording never blocks meaningfully and never fails; a poisoned lock is
//! recovered rather than propagated.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub mod names {
    pub const CONNECTIONS_ACCEPTED: &str = "connections.accepted";
    pub const CONNECTIONS_REJECTED: &str = "connections.rejected";
    pub const CONNECTIONS_CLOSED: &str = "connections.closed";
    pub const ACTIVE_SESSIONS: &str = "sessions.active";
    pub const ACTIVE_ROOMS: &str = "rooms.active";
    pub const ACTIVE_TRANSFERS: &str = "transfers.active";
    pub const BYTES_RECEIVED: &str = "bytes.received";
    pub const BYTES_SENT: &str = "bytes.sent";
    pub const FRAMES_RECEIVED: &str = "frames.received";
    pub const FRAMES_SENT: &str = "frames.sent";
    pub const FRAME_ERRORS: &str = "frames.invalid";
    pub const SEND_OVERFLOWS: &str = "sends.overflowed";
    pub const DISPATCH_FAILURES: &str = "dispatch.failures";
    pub const LOGINS: &str = "logins";
    pub const CHAT_MESSAGES: &str = "chat.messages";
    pub const TRANSFERS_COMPLETED: &str = "transfers.completed";
    pub const TRANSFERS_EXPIRED: &str = "transfers.expired";
    pub const FRAME_SIZE: &str = "frame.size";
    pub const DISPATCH_MICROS: &str = "dispatch.micros";
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Histogram {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, i64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Histogram>,
    started: Option<(Instant, DateTime<Utc>)>,
}

/// Serializable point-in-time view, keys sorted for stable output.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub counters: BTreeMap<String, i64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, Histogram>,
}

#[derive(Default)]
pub struct Statistics {
    inner: Mutex<Inner>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn decrement(&self, name: &str) {
        self.add(name, -1);
    }

    pub fn add(&self, name: &str, delta: i64) {
        *self.lock().counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn set(&self, name: &str, value: i64) {
        self.lock().counters.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.lock().gauges.insert(name.to_string(), value);
    }

    pub fn get_gauge(&self, name: &str) -> f64 {
        self.lock().gauges.get(name).copied().unwrap_or(0.0)
    }

    pub fn record_value(&self, name: &str, value: f64) {
        self.lock()
            .histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    pub fn average(&self, name: &str) -> f64 {
        self.histogram(name).map(|h| h.average()).unwrap_or(0.0)
    }

    pub fn min(&self, name: &str) -> f64 {
        self.histogram(name).map(|h| h.min).unwrap_or(0.0)
    }

    pub fn max(&self, name: &str) -> f64 {
        self.histogram(name).map(|h| h.max).unwrap_or(0.0)
    }

    pub fn histogram(&self, name: &str) -> Option<Histogram> {
        self.lock().histograms.get(name).copied()
    }

    /// Clear every metric. The start time is kept.
    pub fn reset_all(&self) {
        let mut inner = self.lock();
        inner.counters.clear();
        inner.gauges.clear();
        inner.histograms.clear();
    }

    pub fn mark_server_start(&self) {
        self.lock().started = Some((Instant::now(), Utc::now()));
    }

    pub fn uptime(&self) -> Duration {
        self.lock()
            .started
            .map(|(at, _)| at.elapsed())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        StatsSnapshot {
            started_at: inner.started.map(|(_, wall)| wall),
            uptime_secs: inner
                .started
                .map(|(at, _)| at.elapsed().as_secs())
                .unwrap_or(0),
            counters: inner.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: inner.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            histograms: inner
                .histograms
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Human-readable multi-line report.
    pub fn generate_report(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "=== Server Statistics ===");
        if let Some(started) = snapshot.started_at {
            let _ = writeln!(out, "Started: {}", started.to_rfc3339());
        }
        let _ = writeln!(out, "Uptime: {}s", snapshot.uptime_secs);

        if !snapshot.counters.is_empty() {
            let _ = writeln!(out, "\n[Counters]");
            for (name, value) in &snapshot.counters {
                let _ = writeln!(out, "  {}: {}", name, value);
            }
        }
        if !snapshot.gauges.is_empty() {
            let _ = writeln!(out, "\n[Gauges]");
            for (name, value) in &snapshot.gauges {
                let _ = writeln!(out, "  {}: {:.2}", name, value);
            }
        }
        if !snapshot.histograms.is_empty() {
            let _ = writeln!(out, "\n[Histograms]");
            for (name, h) in &snapshot.histograms {
                let _ = writeln!(
                    out,
                    "  {}: count={} avg={:.2} min={:.2} max={:.2}",
                    name,
                    h.count,
                    h.average(),
                    h.min,
                    h.max
                );
            }
        }
        out
    }
}
