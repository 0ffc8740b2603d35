//! Public facade over the transport.
//!
//! Upstream collaborators use only this type: initialize, send, receive,
//! close, metrics and lifecycle listeners. The state machine is created by
//! `initialize()` and torn down by `close()`; the router, the metrics and
//! the event bus live as long as the manager.

use std::sync::Arc;

use bytes::Bytes;
use fleet_protocol::{ConnectionState, ErrorKind, Frame, LifecycleEvent, MetricsSnapshot, TransportMode};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cert::CertificateProvider;
use crate::config::TransportConfig;
use crate::connection::ConnectionStateMachine;
use crate::error::TransportError;
use crate::events::{EventBus, ListenerHandle};
use crate::link::{Dialer, NetworkDialer};
use crate::metrics::MetricsCollector;
use crate::router::{BoxError, ChannelRouter, Subscription};

enum Lifecycle {
    Idle,
    Active(Arc<ConnectionStateMachine>),
    Closed { mode: TransportMode },
}

impl Lifecycle {
    fn check_initialize(&self) -> Result<(), TransportError> {
        match self {
            Self::Closed { .. } => Err(TransportError::AlreadyClosed),
            Self::Active(machine) if machine.state() != ConnectionState::Failed => {
                Err(TransportError::AlreadyInitialized)
            }
            _ => Ok(()),
        }
    }
}

pub struct TransportManager {
    config: TransportConfig,
    certificates: CertificateProvider,
    dialer: Option<Arc<dyn Dialer>>,
    router: Arc<ChannelRouter>,
    metrics: Arc<MetricsCollector>,
    events: Arc<EventBus>,
    lifecycle: Mutex<Lifecycle>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            certificates: CertificateProvider::new(),
            dialer: None,
            router: Arc::new(ChannelRouter::new()),
            metrics: Arc::new(MetricsCollector::new()),
            events: EventBus::new(),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Use `dialer` instead of opening real QUIC / TCP sockets.
    pub fn with_dialer(config: TransportConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer: Some(dialer),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Load the identity and connect. Resolves once CONNECTED, or with the
    /// error that ended the attempt. Allowed again only after FAILED.
    pub async fn initialize(&self) -> Result<(), TransportError> {
        self.lifecycle.lock().check_initialize()?;

        // Disk and endpoint setup run without the lifecycle lock held.
        self.config.validate()?;
        let identity = self.certificates.load_or_generate(
            self.config.cert_path.as_deref(),
            self.config.key_path.as_deref(),
        )?;
        let dialer = match &self.dialer {
            Some(dialer) => Arc::clone(dialer),
            None => Arc::new(NetworkDialer::new(&self.config, &identity)?) as Arc<dyn Dialer>,
        };

        let machine = {
            let mut lifecycle = self.lifecycle.lock();
            // A concurrent initialize or close may have won meanwhile.
            lifecycle.check_initialize()?;

            let machine = Arc::new(ConnectionStateMachine::start(
                self.config.clone(),
                dialer,
                Arc::clone(&self.metrics),
                Arc::clone(&self.events),
                Arc::clone(&self.router),
            ));
            *lifecycle = Lifecycle::Active(Arc::clone(&machine));
            machine
        };

        info!(
            host = %self.config.host,
            port = self.config.port,
            node = machine.node_id(),
            "initializing transport"
        );
        machine.wait_settled().await
    }

    /// Queue `payload` on `channel`. Fails fast unless CONNECTED.
    pub async fn send(&self, channel: &str, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        let machine = match &*self.lifecycle.lock() {
            Lifecycle::Idle => return Err(TransportError::NotConnected(ConnectionState::Disconnected)),
            Lifecycle::Closed { .. } => return Err(TransportError::AlreadyClosed),
            Lifecycle::Active(machine) => Arc::clone(machine),
        };
        machine.send(Frame::data(channel, payload)).await
    }

    /// Subscribe to inbound payloads on `channel`. Works in any state and
    /// survives reconnects.
    pub fn receive<F>(&self, channel: &str, callback: F) -> Subscription
    where
        F: Fn(&Bytes) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let handle = self.router.subscribe(channel, callback);
        Subscription::new(handle, &self.router)
    }

    /// Release everything. Idempotent; races with `initialize` resolve the
    /// pending initialize with `AlreadyClosed`.
    pub async fn close(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            let mode = match &*lifecycle {
                Lifecycle::Active(machine) => machine.mode(),
                Lifecycle::Closed { mode } => *mode,
                Lifecycle::Idle => TransportMode::Uninitialized,
            };
            std::mem::replace(&mut *lifecycle, Lifecycle::Closed { mode })
        };

        match previous {
            Lifecycle::Closed { .. } => {
                debug!("close() on an already closed transport");
                return;
            }
            Lifecycle::Active(machine) => machine.shutdown().await,
            Lifecycle::Idle => self.events.emit(LifecycleEvent::StateChange {
                state: ConnectionState::Closed,
            }),
        }

        self.events.close();
        info!("transport closed");
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle => ConnectionState::Disconnected,
            Lifecycle::Active(machine) => machine.state(),
            Lifecycle::Closed { .. } => ConnectionState::Closed,
        }
    }

    pub fn get_mode(&self) -> TransportMode {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle => TransportMode::Uninitialized,
            Lifecycle::Active(machine) => machine.mode(),
            Lifecycle::Closed { mode } => *mode,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.get_mode(), self.state())
    }

    pub fn on_state_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.events.on_state_change(listener)
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(ErrorKind, &str) + Send + Sync + 'static,
    {
        self.events.on_error(listener)
    }

    pub fn on_reconnected<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.on_reconnected(listener)
    }

    /// Lifecycle events as a stream for async consumers.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}
