//! Channel-based fan-out of inbound payloads to local subscribers.
//!
//! Channels come into existence on first subscribe and disappear when the
//! last subscriber leaves. Dispatch order is subscription order. A failing
//! or panicking subscriber is reported in the [`DispatchReport`] and does
//! not stop delivery to the others.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback. Runs on the connection's reader task, so it should
/// hand heavy work off rather than block.
pub type Callback = Arc<dyn Fn(&Bytes) -> Result<(), BoxError> + Send + Sync>;

/// Identifies one registration of a callback on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub subscription: u64,
    pub channel: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<DispatchFailure>,
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
pub struct ChannelRouter {
    channels: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, channel: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Bytes) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.channels
            .write()
            .entry(channel.clone())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        debug!(%channel, subscription = id, "subscribed");
        SubscriptionHandle { id, channel }
    }

    /// Remove a registration. Unknown or already-removed handles are a no-op.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut channels = self.channels.write();
        let Some(subscribers) = channels.get_mut(&handle.channel) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            channels.remove(&handle.channel);
        }
        if removed {
            debug!(channel = %handle.channel, subscription = handle.id, "unsubscribed");
        }
        removed
    }

    /// Deliver `payload` to every current subscriber of `channel`.
    pub fn dispatch(&self, channel: &str, payload: &Bytes) -> DispatchReport {
        // Snapshot under the read lock; callbacks may (un)subscribe re-entrantly.
        let subscribers = match self.channels.read().get(channel) {
            Some(list) => list.clone(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for subscriber in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(payload)));
            let error = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(%channel, subscription = subscriber.id, %error, "subscriber failed");
            report.failures.push(DispatchFailure {
                subscription: subscriber.id,
                channel: channel.to_string(),
                error,
            });
        }
        report
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("subscriber panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("subscriber panicked: {s}")
    } else {
        "subscriber panicked".to_string()
    }
}

/// Disposer returned by `TransportManager::receive`.
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    handle: SubscriptionHandle,
    router: Weak<ChannelRouter>,
}

impl Subscription {
    pub(crate) fn new(handle: SubscriptionHandle, router: &Arc<ChannelRouter>) -> Self {
        Self {
            handle,
            router: Arc::downgrade(router),
        }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(router) = self.router.upgrade() {
            router.unsubscribe(&self.handle);
        }
    }
}
