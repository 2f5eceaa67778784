//! Network statistics.
//!
//! Reader and writer counters for one engine, updated with relaxed atomics from any
//! task. Each engine owns its own instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct NetworkStatistics {
    pub read_bytes: AtomicU64,
    pub read_packets: AtomicU64,
    /// Inbound packets that failed to decode or could not be queued
    pub read_dropped_packets: AtomicU64,
    pub written_bytes: AtomicU64,
    pub written_packets: AtomicU64,
    /// Outbound packets shed by queue policy, full queues or write errors
    pub written_dropped_packets: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_refused: AtomicU64,
    pub sessions_closed: AtomicU64,
    start_time: Instant,
}

impl NetworkStatistics {
    pub fn new() -> Self {
        Self {
            read_bytes: AtomicU64::new(0),
            read_packets: AtomicU64::new(0),
            read_dropped_packets: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            written_packets: AtomicU64::new(0),
            written_dropped_packets: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn update_read_bytes(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_read_packets(&self, packets: u64) {
        self.read_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn update_read_dropped_packets(&self, packets: u64) {
        self.read_dropped_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn update_written_bytes(&self, bytes: u64) {
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn update_written_packets(&self, packets: u64) {
        self.written_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn update_written_dropped_packets(&self, packets: u64) {
        self.written_dropped_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_packets: self.read_packets.load(Ordering::Relaxed),
            read_dropped_packets: self.read_dropped_packets.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            written_packets: self.written_packets.load(Ordering::Relaxed),
            written_dropped_packets: self.written_dropped_packets.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            read_bytes = s.read_bytes,
            read_packets = s.read_packets,
            read_dropped_packets = s.read_dropped_packets,
            written_bytes = s.written_bytes,
            written_packets = s.written_packets,
            written_dropped_packets = s.written_dropped_packets,
            connections_accepted = s.connections_accepted,
            connections_refused = s.connections_refused,
            sessions_closed = s.sessions_closed,
            uptime_seconds = s.uptime_seconds,
            "Network statistics snapshot"
        );
    }
}

impl Default for NetworkStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub read_bytes: u64,
    pub read_packets: u64,
    pub read_dropped_packets: u64,
    pub written_bytes: u64,
    pub written_packets: u64,
    pub written_dropped_packets: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub sessions_closed: u64,
    pub uptime_seconds: u64,
}
