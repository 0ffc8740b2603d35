//! Typed lifecycle observers.
//!
//! Each notification kind has its own registration method returning a
//! [`ListenerHandle`] disposer. Listeners run synchronously on the task
//! that emits, in registration order. Async consumers can take a
//! broadcast receiver instead. Once the bus is closed nothing fires.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fleet_protocol::{ConnectionState, ErrorKind, LifecycleEvent};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{trace, warn};

const BROADCAST_CAPACITY: usize = 256;

type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;
type ReconnectedListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
enum Listener {
    State(StateListener),
    Error(ErrorListener),
    Reconnected(ReconnectedListener),
}

pub struct EventBus {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<LifecycleEvent>,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tx,
            closed: AtomicBool::new(false),
        }
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_state_change<F>(self: &Arc<Self>, listener: F) -> ListenerHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.register(Listener::State(Arc::new(listener)))
    }

    pub fn on_error<F>(self: &Arc<Self>, listener: F) -> ListenerHandle
    where
        F: Fn(ErrorKind, &str) + Send + Sync + 'static,
    {
        self.register(Listener::Error(Arc::new(listener)))
    }

    pub fn on_reconnected<F>(self: &Arc<Self>, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Listener::Reconnected(Arc::new(listener)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        if self.is_closed() {
            return;
        }
        trace!(event = event.name(), "lifecycle event");

        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| match (&listener, &event) {
                (Listener::State(f), LifecycleEvent::StateChange { state }) => f(*state),
                (Listener::Error(f), LifecycleEvent::Error { kind, details }) => f(*kind, details),
                (Listener::Reconnected(f), LifecycleEvent::Reconnected) => f(),
                _ => {}
            }));
            if outcome.is_err() {
                warn!(event = event.name(), "lifecycle listener panicked");
            }
        }

        // No receivers is fine
        let _ = self.tx.send(event);
    }

    /// Stop all further notifications. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn register(self: &Arc<Self>, listener: Listener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.write().push((id, listener));
        ListenerHandle {
            id,
            bus: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.listeners.write().retain(|(existing, _)| *existing != id);
    }
}

/// Disposer for a lifecycle listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    id: u64,
    bus: Weak<EventBus>,
}

impl ListenerHandle {
    /// Idempotent.
    pub fn dispose(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
