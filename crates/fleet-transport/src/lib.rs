//! Fleet Transport Layer
//!
//! Client and peer sides of the fleet link. The transport layer handles:
//! - Protocol selection (QUIC first, TCP+TLS fallback)
//! - Connection lifecycle, keep-alive and reconnection with backoff
//! - 0-RTT resumption on reconnect
//! - Channel-based routing of inbound frames to local subscribers
//! - Telemetry counters and latency tracking
//!
//! Upstream code talks to [`TransportManager`] only; the state machine and
//! the router stay internal to it.

pub mod backoff;
pub mod cert;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod link;
pub mod manager;
pub mod metrics;
pub mod peer;
pub mod router;
pub mod tls;

pub use backoff::Backoff;
pub use cert::{CertificateProvider, Identity, fingerprint};
pub use config::TransportConfig;
pub use connection::ConnectionStateMachine;
pub use error::TransportError;
pub use events::{EventBus, ListenerHandle};
pub use link::{Dialer, Link, NetworkDialer};
pub use manager::TransportManager;
pub use metrics::MetricsCollector;
pub use peer::{FleetPeer, PeerConfig};
pub use router::{BoxError, ChannelRouter, DispatchFailure, DispatchReport, Subscription, SubscriptionHandle};

pub use fleet_protocol::{ConnectionState, ErrorKind, LifecycleEvent, MetricsSnapshot, TransportMode};
