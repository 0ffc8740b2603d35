//! Transport telemetry.
//!
//! Counters are monotonic for the lifetime of one collector and are never
//! reset on reconnect. Latency is an exponential moving average
//! (`alpha = 0.2`) seeded with the first sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fleet_protocol::{ConnectionState, MetricsSnapshot, TransportMode};
use parking_lot::Mutex;

/// Weight of the newest latency sample.
pub const LATENCY_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
pub struct MetricsCollector {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_transferred: AtomicU64,
    failed_attempts: AtomicU64,
    active_streams: AtomicU64,
    reconnections: AtomicU64,
    zero_rtt_rejections: AtomicU64,
    latency_ms: Mutex<Option<f64>>,
    connected_at: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zero_rtt_rejection(&self) {
        self.zero_rtt_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut latency = self.latency_ms.lock();
        *latency = Some(match *latency {
            None => ms,
            Some(avg) => avg + LATENCY_ALPHA * (ms - avg),
        });
    }

    pub fn set_active_streams(&self, streams: u64) {
        self.active_streams.store(streams, Ordering::Relaxed);
    }

    pub fn mark_connected(&self) {
        *self.connected_at.lock() = Some(Instant::now());
    }

    pub fn mark_disconnected(&self) {
        *self.connected_at.lock() = None;
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn average_latency_ms(&self) -> f64 {
        self.latency_ms.lock().unwrap_or(0.0)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Point-in-time view; `mode` and `state` come from the state machine.
    pub fn snapshot(&self, mode: TransportMode, state: ConnectionState) -> MetricsSnapshot {
        let uptime = self
            .connected_at
            .lock()
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        MetricsSnapshot {
            mode,
            state,
            average_latency_ms: self.average_latency_ms(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts(),
            connection_uptime_ms: uptime,
            reconnections: self.reconnections.load(Ordering::Relaxed),
            zero_rtt_rejections: self.zero_rtt_rejections.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}
