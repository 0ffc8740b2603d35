//! Connection lifecycle: protocol selection, handshake, keep-alive and
//! reconnection.
//!
//! One driver task owns the link for the lifetime of the state machine.
//! While connected it runs a reader task (inbound frames to the router,
//! pongs to the latency tracker) and a writer task draining the bounded
//! outbound queue, which is the only path to the wire. Every wait the
//! driver performs is raced against the cancellation token, so `shutdown`
//! leaves no timer or socket behind.

use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{
    ConnectionState, ErrorKind, Frame, FrameError, FrameKind, Hello, LifecycleEvent, PROTOCOL_VERSION,
    TransportMode, now_ms, read_frame, write_frame,
};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::EventBus;
use crate::link::{Dialer, Link};
use crate::metrics::MetricsCollector;
use crate::router::ChannelRouter;

/// Time allowed for queued frames and `GOODBYE` to drain on close.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// How long `shutdown` waits for the driver before aborting it.
const DRIVER_STOP_GRACE: Duration = Duration::from_secs(1);

/// Tick used for migration checks when keep-alive is off.
const FALLBACK_TICK: Duration = Duration::from_secs(1);

pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: TransportConfig,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<MetricsCollector>,
    events: Arc<EventBus>,
    router: Arc<ChannelRouter>,
    node_id: String,
    state: watch::Sender<ConnectionState>,
    mode: Mutex<TransportMode>,
    /// Present only while CONNECTED.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    /// Rounds used and last error text once FAILED.
    failure: Mutex<Option<(u32, String)>>,
}

enum AttemptError {
    Cancelled,
    Failed(TransportError),
}

enum Establish {
    Ready(Link),
    Exhausted {
        rounds: u32,
        last_error: Option<TransportError>,
    },
    Cancelled,
}

enum SessionEnd {
    Closed,
    Lost(String),
}

/// Aborts the task when dropped.
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ConnectionStateMachine {
    /// Spawn the driver. The machine moves `DISCONNECTED -> CONNECTING`
    /// immediately and starts the first round.
    pub fn start(
        config: TransportConfig,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<MetricsCollector>,
        events: Arc<EventBus>,
        router: Arc<ChannelRouter>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            config,
            dialer,
            metrics,
            events,
            router,
            node_id: uuid::Uuid::new_v4().to_string(),
            state,
            mode: Mutex::new(TransportMode::Uninitialized),
            outbound: Mutex::new(None),
            failure: Mutex::new(None),
        });

        let cancel = CancellationToken::new();
        let driver = tokio::spawn(Arc::clone(&inner).drive(cancel.clone()));

        Self {
            inner,
            cancel,
            driver: Mutex::new(Some(driver)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn mode(&self) -> TransportMode {
        self.inner.mode()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Suspend until CONNECTED (`Ok`), FAILED or CLOSED (`Err`).
    pub async fn wait_settled(&self) -> Result<(), TransportError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => return Err(self.inner.failure_error()),
                ConnectionState::Closed => return Err(TransportError::AlreadyClosed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::AlreadyClosed);
            }
        }
    }

    /// Queue a frame for the writer. Completes once queued, not when acked.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected(state));
        }
        let Some(tx) = self.inner.outbound.lock().clone() else {
            return Err(TransportError::NotConnected(state));
        };
        frame.validate()?;

        let len = frame.payload.len();
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionLost("link dropped before the frame was queued".into()))?;
        self.inner.metrics.record_sent(len);
        Ok(())
    }

    /// Cancel pending work, flush what can be flushed, release the link and
    /// move to CLOSED. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DRIVER_STOP_GRACE, &mut driver).await.is_err() {
                warn!("connection driver did not stop in time, aborting");
                driver.abort();
            }
        }

        self.inner.outbound.lock().take();
        self.inner.metrics.set_active_streams(0);
        self.inner.dialer.shutdown();
        self.inner.transition(ConnectionState::Closed);
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn mode(&self) -> TransportMode {
        *self.mode.lock()
    }

    fn set_mode(&self, mode: TransportMode) {
        let previous = std::mem::replace(&mut *self.mode.lock(), mode);
        if previous != mode {
            debug!(from = %previous, to = %mode, "transport mode changed");
        }
    }

    /// Apply `next` if the edge is permitted and notify listeners.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        let Some(previous) = previous else {
            debug!(from = %self.state(), to = %next, "state transition refused");
            return false;
        };

        info!(from = %previous, to = %next, mode = %self.mode(), "connection state changed");
        if next == ConnectionState::Connected {
            self.metrics.mark_connected();
        } else if previous == ConnectionState::Connected {
            self.metrics.mark_disconnected();
        }
        self.events.emit(LifecycleEvent::StateChange { state: next });
        true
    }

    fn report(&self, kind: ErrorKind, details: String) {
        self.events.emit(LifecycleEvent::Error { kind, details });
    }

    fn failure_error(&self) -> TransportError {
        match self.failure.lock().as_ref() {
            Some((rounds, details)) => TransportError::RetriesExhausted {
                attempts: *rounds,
                last_error: details.clone(),
            },
            None => TransportError::RetriesExhausted {
                attempts: 0,
                last_error: "unknown".into(),
            },
        }
    }

    async fn drive(self: Arc<Self>, cancel: CancellationToken) {
        if !self.transition(ConnectionState::Connecting) {
            return;
        }

        let mut backoff = Backoff::from_config(&self.config);
        let mut reconnecting = false;

        loop {
            let link = match self.establish(&mut backoff, reconnecting, &cancel).await {
                Establish::Ready(link) => link,
                Establish::Exhausted { rounds, last_error } => {
                    self.fail(rounds, last_error);
                    return;
                }
                Establish::Cancelled => return,
            };
            backoff.reset();

            match self.run_session(link, reconnecting, &cancel).await {
                SessionEnd::Closed => return,
                SessionEnd::Lost(reason) => {
                    warn!(reason = %reason, mode = %self.mode(), "connection lost");
                    self.metrics.set_last_error(format!("connection lost: {reason}"));
                    self.report(ErrorKind::ConnectionLost, reason);
                    if !self.transition(ConnectionState::Reconnecting) {
                        return;
                    }
                    reconnecting = true;
                }
            }
        }
    }

    fn fail(&self, rounds: u32, last_error: Option<TransportError>) {
        let details = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt completed".into());
        error!(rounds, error = %details, "retries exhausted");
        self.metrics.set_last_error(format!("retries exhausted: {details}"));
        *self.failure.lock() = Some((rounds, details.clone()));
        self.transition(ConnectionState::Failed);
        self.report(ErrorKind::RetriesExhausted, details);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Establishment
    // ─────────────────────────────────────────────────────────────────────

    async fn establish(&self, backoff: &mut Backoff, reconnecting: bool, cancel: &CancellationToken) -> Establish {
        let rounds = self.config.max_retries.saturating_add(1);
        let mut last_error = None;

        for round in 0..rounds {
            if round > 0 || reconnecting {
                let delay = backoff.next_delay();
                debug!(round, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Establish::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.round(round, cancel).await {
                Ok(link) => return Establish::Ready(link),
                Err(AttemptError::Cancelled) => return Establish::Cancelled,
                Err(AttemptError::Failed(e)) => last_error = Some(e),
            }
        }

        Establish::Exhausted { rounds, last_error }
    }

    /// QUIC first unless fallback already stuck, then TCP+TLS if allowed.
    async fn round(&self, round: u32, cancel: &CancellationToken) -> Result<Link, AttemptError> {
        if self.mode() != TransportMode::TcpFallback {
            self.set_mode(TransportMode::Quic);
            match self.attempt(TransportMode::Quic, cancel).await {
                Ok(link) => return Ok(link),
                Err(AttemptError::Failed(e)) => {
                    self.attempt_failed(round, TransportMode::Quic, &e);
                    if !self.config.enable_tcp_fallback {
                        return Err(AttemptError::Failed(e));
                    }
                    info!(round, "QUIC unavailable, falling back to TCP+TLS");
                    self.set_mode(TransportMode::TcpFallback);
                    if self.state() == ConnectionState::Connecting {
                        self.transition(ConnectionState::Connecting);
                    }
                }
                Err(AttemptError::Cancelled) => return Err(AttemptError::Cancelled),
            }
        }

        match self.attempt(TransportMode::TcpFallback, cancel).await {
            Err(AttemptError::Failed(e)) => {
                self.attempt_failed(round, TransportMode::TcpFallback, &e);
                Err(AttemptError::Failed(e))
            }
            other => other,
        }
    }

    /// Dial plus application handshake, bounded by the connection timeout.
    async fn attempt(&self, mode: TransportMode, cancel: &CancellationToken) -> Result<Link, AttemptError> {
        let timeout = self.config.connection_timeout();
        debug!(%mode, timeout_ms = timeout.as_millis() as u64, "dialing");

        let handshake = async {
            match self.dialer.dial(mode).await {
                Ok(link) => self.handshake(link).await,
                Err(e) => Err(e),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            outcome = tokio::time::timeout(timeout, handshake) => match outcome {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(e)) => Err(AttemptError::Failed(e)),
                Err(_) => Err(AttemptError::Failed(TransportError::HandshakeTimeout(timeout))),
            },
        }
    }

    /// Counted and logged only; listeners hear about handshake failures once
    /// retries are exhausted.
    fn attempt_failed(&self, round: u32, mode: TransportMode, error: &TransportError) {
        self.metrics.record_failed_attempt();
        self.metrics.set_last_error(format!("{mode}: {error}"));
        warn!(round, %mode, kind = %error.kind(), error = %error, "handshake attempt failed");
    }

    async fn handshake(&self, mut link: Link) -> Result<Link, TransportError> {
        let hello = Frame::hello(
            FrameKind::Hello,
            &Hello {
                version: PROTOCOL_VERSION.into(),
                node_id: self.node_id.clone(),
            },
        )?;
        write_frame(link.writer(), &hello).await?;

        if let Some(accepted) = link.take_early_data() {
            if accepted.await {
                debug!("0-RTT data accepted");
            } else {
                // The peer discarded the early HELLO; repeat it at 1-RTT.
                self.metrics.record_zero_rtt_rejection();
                debug!("0-RTT data rejected, resending handshake");
                link.reopen_stream().await?;
                write_frame(link.writer(), &hello).await?;
            }
        }

        match read_frame(link.reader()).await? {
            Some(frame) if frame.kind == FrameKind::HelloAck => {
                let ack = frame.parse_hello()?;
                if ack.version != PROTOCOL_VERSION {
                    return Err(TransportError::Handshake(format!(
                        "peer speaks protocol version {}",
                        ack.version
                    )));
                }
                debug!(peer = %ack.node_id, mode = %link.mode(), "handshake complete");
                Ok(link)
            }
            Some(frame) => Err(TransportError::Handshake(format!(
                "unexpected {:?} frame during handshake",
                frame.kind
            ))),
            None => Err(TransportError::Handshake("peer closed the link during handshake".into())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────

    async fn run_session(self: &Arc<Self>, link: Link, reconnecting: bool, cancel: &CancellationToken) -> SessionEnd {
        let mode = link.mode();
        let remote = link.remote_address();
        let (mut reader, mut writer, control) = link.into_parts();

        let (tx, mut rx) = mpsc::channel::<Frame>(self.config.outbound_capacity());
        let last_ack = Arc::new(Mutex::new(Instant::now()));

        let mut writer_task = TaskGuard(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let goodbye = frame.kind == FrameKind::Goodbye;
                match write_frame(&mut writer, &frame).await {
                    Ok(()) => {}
                    Err(FrameError::Io(e)) => return format!("write failed: {e}"),
                    // Nothing reached the wire, so the stream is still in sync.
                    Err(e) => {
                        warn!(kind = ?frame.kind, channel = %frame.channel, error = %e, "dropping unencodable frame");
                        continue;
                    }
                }
                if goodbye {
                    let _ = writer.shutdown().await;
                    return "goodbye sent".to_string();
                }
            }
            "outbound queue closed".to_string()
        }));

        let mut reader_task = {
            let inner = Arc::clone(self);
            let pong_tx = tx.clone();
            let last_ack = Arc::clone(&last_ack);
            TaskGuard(tokio::spawn(async move {
                loop {
                    let frame = match read_frame(&mut reader).await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return "peer closed the link".to_string(),
                        Err(e) => return format!("read failed: {e}"),
                    };
                    match frame.kind {
                        FrameKind::Data => inner.deliver(frame),
                        FrameKind::Ping => {
                            let _ = pong_tx.try_send(Frame::pong(&frame));
                        }
                        FrameKind::Pong => {
                            *last_ack.lock() = Instant::now();
                            let rtt = now_ms().saturating_sub(frame.sent_at_ms);
                            inner.metrics.record_latency(rtt as f64);
                        }
                        FrameKind::Goodbye => return "peer said goodbye".to_string(),
                        FrameKind::Hello | FrameKind::HelloAck => {
                            debug!(kind = ?frame.kind, "ignoring handshake frame mid-session");
                        }
                    }
                }
            }))
        };

        *self.outbound.lock() = Some(tx.clone());
        self.metrics.set_active_streams(1);
        self.set_mode(mode);

        if !self.transition(ConnectionState::Connected) {
            self.outbound.lock().take();
            self.metrics.set_active_streams(0);
            control.close("closing");
            return SessionEnd::Closed;
        }
        if reconnecting {
            self.metrics.record_reconnection();
            info!(%mode, "reconnected");
            self.events.emit(LifecycleEvent::Reconnected);
        }

        let keep_alive = self.config.keep_alive;
        let tick = if keep_alive && !self.config.keep_alive_interval().is_zero() {
            self.config.keep_alive_interval()
        } else {
            FALLBACK_TICK
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Closed,
                reason = &mut reader_task.0 => break SessionEnd::Lost(join_reason(reason)),
                reason = &mut writer_task.0 => break SessionEnd::Lost(join_reason(reason)),
                _ = ticker.tick() => {
                    if let (Some(before), Some(now)) = (remote, control.remote_address()) {
                        if before != now {
                            break SessionEnd::Lost(format!("connection migrated from {before} to {now}"));
                        }
                    }
                    if keep_alive {
                        let silent = last_ack.lock().elapsed();
                        if silent >= tick * 2 {
                            break SessionEnd::Lost(format!(
                                "no keep-alive ack for {} ms",
                                silent.as_millis()
                            ));
                        }
                        if tx.try_send(Frame::ping()).is_err() {
                            debug!("outbound queue full, skipping keep-alive probe");
                        }
                    }
                }
            }
        };

        self.outbound.lock().take();

        if let SessionEnd::Closed = end {
            // Frames already queued drain ahead of GOODBYE.
            let deadline = Instant::now() + CLOSE_GRACE;
            let goodbye = tx.send(Frame::control(FrameKind::Goodbye));
            if tokio::time::timeout_at(deadline, goodbye).await.is_ok()
                && tokio::time::timeout_at(deadline, &mut writer_task.0).await.is_err()
            {
                debug!("close grace elapsed before the outbound queue drained");
            }
        }

        drop(tx);
        self.metrics.set_active_streams(0);
        control.close(match end {
            SessionEnd::Closed => "closed",
            SessionEnd::Lost(_) => "connection lost",
        });
        end
    }

    fn deliver(&self, frame: Frame) {
        self.metrics.record_received(frame.payload.len());
        let report = self.router.dispatch(&frame.channel, &frame.payload);
        for failure in report.failures {
            self.report(
                ErrorKind::Subscriber,
                format!(
                    "channel {} subscription {}: {}",
                    failure.channel, failure.subscription, failure.error
                ),
            );
        }
    }
}

fn join_reason(joined: Result<String, JoinError>) -> String {
    joined.unwrap_or_else(|e| format!("I/O task ended abnormally: {e}"))
}
