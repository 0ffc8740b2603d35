//! Metrics snapshot shape consumed by observability tooling.

use serde::{Deserialize, Serialize};

use crate::state::{ConnectionState, TransportMode};

/// Immutable point-in-time view of a transport's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub mode: TransportMode,
    pub state: ConnectionState,
    /// Exponential moving average of keep-alive round trips (alpha = 0.2).
    pub average_latency_ms: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Payload bytes in both directions.
    pub bytes_transferred: u64,
    pub active_streams: u64,
    pub failed_attempts: u64,
    /// Time since the last transition into CONNECTED; 0 while not connected.
    pub connection_uptime_ms: u64,
    pub reconnections: u64,
    pub zero_rtt_rejections: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
