//! Fleet Transport - Protocol Types
//!
//! Wire-level and observable types shared by both ends of a fleet link.
//! This crate is the single source of truth for the frame layout,
//! connection states, transport modes, error kinds and lifecycle event names.

pub mod error;
pub mod events;
pub mod frame;
pub mod metrics;
pub mod state;

pub use error::{ErrorKind, FrameError};
pub use events::{EventName, Events, LifecycleEvent};
pub use frame::{Frame, FrameKind, Hello, MAX_FRAME_SIZE, decode, now_ms, read_frame, write_frame};
pub use metrics::MetricsSnapshot;
pub use state::{ConnectionState, TransportMode};

/// ALPN protocol identifier spoken on both QUIC and TCP+TLS links.
pub const ALPN_FLEET: &[u8] = b"fleet/1";

/// Protocol version carried in `HELLO` / `HELLO_ACK` payload headers.
pub const PROTOCOL_VERSION: &str = "1";
