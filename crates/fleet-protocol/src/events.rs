//! Lifecycle event names and payloads.
//!
//! Events are transport-to-collaborator notifications with no response
//! expected. Listeners subscribe per kind.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::state::ConnectionState;

/// All lifecycle event names.
pub struct Events;

impl Events {
    pub const STATE_CHANGE: &str = "stateChange";
    pub const ERROR: &str = "error";
    pub const RECONNECTED: &str = "reconnected";
}

/// Type alias for event names.
pub type EventName = &'static str;

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    StateChange { state: ConnectionState },
    Error { kind: ErrorKind, details: String },
    Reconnected,
}

impl LifecycleEvent {
    pub fn name(&self) -> EventName {
        match self {
            Self::StateChange { .. } => Events::STATE_CHANGE,
            Self::Error { .. } => Events::ERROR,
            Self::Reconnected => Events::RECONNECTED,
        }
    }
}
