//! Session entry point and reconnection engine.
//!
//! `SessionManager` builds a [`Session`]: it wires the transport, the
//! connection manager, the subscription tracker and the dispatcher together,
//! and spawns the task that consumes transport events.
//!
//! # Reconnection
//!
//! An unsolicited drop of a connected link starts a reconnect cycle. A cycle
//! makes up to `max_attempts` attempts, spaced by the banded backoff; each
//! attempt fetches a fresh endpoint, connects and waits for the ack. On the
//! first confirmed connect it drops stale ack bookkeeping, restores the topic
//! set and ends, whether or not every topic came back. If the link drops
//! again while the topics are being restored, the cycle goes on with its next
//! attempt. Only one cycle runs at a time; further triggers while one is
//! running are ignored.
//!
//! After `shutdown()` no cycle issues another connect: a lookup in flight is
//! abandoned and later triggers end as [`CycleOutcome::Cancelled`].
//!
//! One timer drives proactive reconnects. After an explicit `connect()` it is
//! a watchdog that starts a cycle if no ack arrives in time; once connected it
//! is re-armed as the health timer, which periodically closes the link and
//! reconnects with a fresh endpoint.
//!
//! # Subscribing
//!
//! A SUBSCRIBE the transport refuses outright, for instance while the link is
//! down, is returned to the caller as an error and the topic is not recorded.
//! Only acknowledged topics are restored after a reconnect.
//!
//! # Example
//!
//! ```ignore
//! let provider = Arc::new(StaticConnectionInfo::new(&wss_url)?);
//! let session = SessionManager::from_config(config)?
//!     .build_and_start(provider)
//!     .await?;
//!
//! session.add_event_handler(HandlerKind::Update, handler).await;
//! session.connect().await?;
//! session.subscribe("prd/app_subscriptions/device-42/#").await?;
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    backoff::{Backoff, BackoffSchedule},
    client::RumqttTransport,
    config::{Config, ReconnectConfig},
    connection::ConnectionManager,
    connection_info::{ConnectionInfoProvider, Endpoint},
    dispatcher::{Dispatcher, HandlerKind, HandlerRegistry, SessionHandler},
    error::SessionError,
    state::SessionState,
    subscription::{ResubscribeReport, SubscriptionTracker},
    timer::Timer,
    transport::{RequestId, Transport, TransportEvent},
};

/// How a reconnect cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The transport connected; carries the resubscription result.
    Connected(ResubscribeReport),
    /// Every attempt failed.
    GaveUp { attempts: u32 },
    /// The session was shut down mid-cycle.
    Cancelled,
    /// Another cycle was already running.
    AlreadyRunning,
}

/// Entry point for building a session.
pub struct SessionManager {
    config: Config,
}

impl SessionManager {
    /// Creates a manager from a configuration, validating it first.
    pub fn from_config(config: Config) -> Result<Self, SessionError> {
        config.validate_all()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds a session speaking MQTT over secure websockets.
    pub async fn build_and_start(
        self,
        provider: Arc<dyn ConnectionInfoProvider>,
    ) -> Result<Session, SessionError> {
        let transport = Arc::new(RumqttTransport::new(self.config.clone()));
        self.with_transport(provider, transport).await
    }

    /// Builds a session on top of any transport.
    pub async fn with_transport(
        self,
        provider: Arc<dyn ConnectionInfoProvider>,
        transport: Arc<dyn Transport>,
    ) -> Result<Session, SessionError> {
        info!("Building session for client '{}'", self.config.client_id);

        let (sink, events) = mpsc::unbounded_channel();
        transport.attach(sink);

        let registry = Arc::new(HandlerRegistry::default());
        let reconnect = self.config.reconnect;
        let schedule = BackoffSchedule::from_config(&reconnect);

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let weak = weak.clone();
            let timer = Timer::new("reconnect", move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.process_reconnect().await;
                    }
                }
            });

            SessionInner {
                connection: ConnectionManager::new(transport.clone(), provider),
                tracker: SubscriptionTracker::new(transport),
                dispatcher: Dispatcher::new(registry),
                timer,
                schedule,
                reconnect,
                reconnecting: AtomicBool::new(false),
                cycles: AtomicUsize::new(0),
                cancel: CancellationToken::new(),
                events_cancel: CancellationToken::new(),
            }
        });

        tokio::spawn(run_events(inner.clone(), events));
        info!("Session built successfully");

        Ok(Session { inner })
    }
}

struct SessionInner {
    connection: ConnectionManager,
    tracker: SubscriptionTracker,
    dispatcher: Dispatcher,
    timer: Timer,
    schedule: BackoffSchedule,
    reconnect: ReconnectConfig,

    /// Guard against concurrent reconnect cycles.
    reconnecting: AtomicBool,

    /// Cycles started, for observability.
    cycles: AtomicUsize,

    /// Stops cycles and waits; fired first on shutdown.
    cancel: CancellationToken,

    /// Stops the event task; fired after the final disconnect completed.
    events_cancel: CancellationToken,
}

/// Clears the cycle guard and the disconnect request when a cycle ends.
struct CycleGuard<'a> {
    inner: &'a SessionInner,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.inner.connection.clear_disconnect_request();
        self.inner.reconnecting.store(false, Ordering::Release);
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

async fn run_events(inner: Arc<SessionInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    loop {
        tokio::select! {
            _ = inner.events_cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => inner.handle_event(event).await,
                None => break,
            },
        }
    }
    debug!("Transport event task stopped");
}

impl SessionInner {
    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnAck { success: true, .. } => {
                info!("MQTT client connected");
                self.connection.update_state(SessionState::Connected);
                self.timer
                    .start(secs(self.reconnect.health_check_interval))
                    .await;
                self.connection.set_connected(true);
                self.dispatcher.notify_connected().await;
            }
            TransportEvent::ConnAck {
                success: false,
                code,
            } => {
                info!("MQTT connection failed: {}", code);
            }
            TransportEvent::Disconnected { reason } => {
                let reason = reason.unwrap_or_else(|| "unknown".to_string());
                let was_connected = self.connection.state().is_connected();
                self.connection.set_connected(false);

                if self.connection.disconnect_requested() {
                    info!("Client disconnected, not attempting to reconnect");
                    self.connection.resolve_disconnect();
                    if !self.reconnecting.load(Ordering::Acquire) {
                        self.connection.update_state(SessionState::Disconnected);
                    }
                } else if was_connected {
                    info!("MQTT server disconnected, reason: {}", reason);
                    self.timer.cancel().await;
                    self.connection.update_state(SessionState::Disconnected);
                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner.reconnect_cycle().await;
                    });
                } else {
                    debug!("Disconnect while not connected: {}", reason);
                }

                self.dispatcher.notify_disconnected(&reason).await;
            }
            TransportEvent::SubAck { id, granted } => {
                self.tracker.handle_ack(id, &granted).await;
            }
            TransportEvent::Message { topic, payload } => {
                self.dispatcher.dispatch(&topic, &payload).await;
            }
        }
    }

    /// Closes the link if it is up, then runs a reconnect cycle.
    async fn process_reconnect(&self) -> CycleOutcome {
        if self.cancel.is_cancelled() {
            debug!("Session is shut down, ignoring reconnect request");
            return CycleOutcome::Cancelled;
        }
        info!("Processing reconnect request");

        let done = self.connection.request_disconnect();
        if self.connection.is_connected() {
            match self.connection.transport().disconnect().await {
                Ok(()) => {
                    let timeout = secs(self.reconnect.disconnect_timeout);
                    if tokio::time::timeout(timeout, done).await.is_err() {
                        warn!("Disconnect did not complete within {:?}", timeout);
                    }
                }
                Err(e) => warn!("Disconnect before reconnect failed: {}", e),
            }
        }

        self.reconnect_cycle().await
    }

    async fn reconnect_cycle(&self) -> CycleOutcome {
        if self.cancel.is_cancelled() {
            debug!("Session is shut down, not starting a reconnect cycle");
            return CycleOutcome::Cancelled;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Already attempting to reconnect, second attempt cancelled");
            return CycleOutcome::AlreadyRunning;
        }
        let _guard = CycleGuard { inner: self };
        self.cycles.fetch_add(1, Ordering::AcqRel);

        info!("Attempting MQTT connect/reconnect");
        let mut backoff = Backoff::new(self.schedule.clone());
        let mut last_failure: Option<&'static str> = None;

        loop {
            let delay = match backoff.next_sleep() {
                Ok(delay) => delay,
                Err(e) => {
                    error!(
                        "Max reconnection attempts ({}) reached, giving up: {}",
                        self.schedule.max_attempts(),
                        e
                    );
                    self.connection.update_state(SessionState::GivingUp);
                    self.connection.update_state(SessionState::Disconnected);
                    return CycleOutcome::GaveUp {
                        attempts: backoff.attempt(),
                    };
                }
            };

            self.connection.update_state(SessionState::Reconnecting {
                attempt: backoff.attempt(),
                delay_secs: delay.as_secs_f64(),
            });

            if !delay.is_zero() {
                debug!("MQTT throttle for {:?}", delay);
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("Reconnect cancelled during backoff");
                        self.connection.update_state(SessionState::Disconnected);
                        return CycleOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt_connect().await {
                Ok(()) => {
                    self.tracker.clear_pending().await;
                    let report = self
                        .tracker
                        .resubscribe_all(secs(self.reconnect.subscribe_ack_timeout))
                        .await;
                    if !self.connection.is_connected() {
                        warn!("Connection lost while restoring subscriptions, retrying");
                        last_failure = None;
                        continue;
                    }
                    return CycleOutcome::Connected(report);
                }
                Err(SessionError::Cancelled) => {
                    info!("Reconnect cancelled while waiting for the broker");
                    self.connection.update_state(SessionState::Disconnected);
                    return CycleOutcome::Cancelled;
                }
                Err(e) => {
                    if last_failure != Some(e.kind()) {
                        warn!("MQTT connection error: {}", e);
                        last_failure = Some(e.kind());
                    } else {
                        debug!("MQTT connection error (repeated): {}", e);
                    }
                }
            }
        }
    }

    async fn attempt_connect(&self) -> Result<(), SessionError> {
        let endpoint = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            endpoint = self
                .connection
                .fetch_endpoint(secs(self.reconnect.connection_info_timeout)) => endpoint?,
        };
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        self.connection.set_connected(false);
        info!("Attempting to reconnect...");
        self.connection.connect_to(&endpoint).await?;

        self.connection
            .wait_connected(secs(self.reconnect.connect_timeout), &self.cancel)
            .await
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Resolves the endpoint and starts connecting.
    ///
    /// Fails only if the endpoint cannot be resolved. The connect outcome is
    /// reported through the state channel; if no ack arrives within the
    /// watchdog period a reconnect cycle takes over.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }

        let inner = &self.inner;
        inner.connection.clear_disconnect_request();
        let endpoint = inner
            .connection
            .fetch_endpoint(secs(inner.reconnect.connection_info_timeout))
            .await?;

        inner.connection.update_state(SessionState::Connecting);
        inner.timer.start(secs(inner.reconnect.connect_watchdog)).await;

        if let Err(e) = inner.connection.connect_to(&endpoint).await {
            warn!("Connect failed, leaving it to the watchdog: {}", e);
        }
        Ok(())
    }

    /// Requests a graceful close without waiting for it. No reconnect follows.
    pub async fn disconnect(&self) {
        self.inner.timer.cancel().await;
        if let Err(e) = self.inner.connection.disconnect().await {
            debug!("Disconnect request failed: {}", e);
        }
    }

    /// Requests a graceful close and waits until the transport reports it,
    /// bounded by the configured disconnect timeout. No-op when not connected.
    pub async fn disconnect_and_wait(&self) -> Result<(), SessionError> {
        if !self.inner.connection.is_connected() {
            debug!("Not connected, nothing to disconnect");
            return Ok(());
        }

        self.inner.timer.cancel().await;
        let done = self.inner.connection.disconnect().await?;

        let timeout = secs(self.inner.reconnect.disconnect_timeout);
        match tokio::time::timeout(timeout, done).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Disconnect did not complete within {:?}", timeout);
                Ok(())
            }
        }
    }

    /// Subscribes without waiting for the ack. The topic joins the set once
    /// the ack arrives.
    ///
    /// A refusal by the transport, such as [`SessionError::NotConnected`], is
    /// returned as is and the topic is not recorded.
    pub async fn subscribe(&self, topic: &str) -> Result<RequestId, SessionError> {
        self.inner.tracker.subscribe(topic).await
    }

    /// Subscribes and waits up to `timeout` for the ack.
    pub async fn subscribe_with_ack(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.inner.tracker.subscribe_with_ack(topic, timeout).await
    }

    /// Registers a handler for `kind`. Returns false if it was already there.
    pub async fn add_event_handler(
        &self,
        kind: HandlerKind,
        handler: Arc<dyn SessionHandler>,
    ) -> bool {
        self.inner
            .dispatcher
            .registry()
            .register(kind, handler)
            .await
    }

    /// Runs a reconnect cycle now, unless one is already running or the
    /// session is shut down.
    pub async fn reconnect(&self) -> CycleOutcome {
        self.inner.reconnect_cycle().await
    }

    /// Closes the link if it is up and reconnects with a fresh endpoint.
    pub async fn force_reconnect(&self) -> CycleOutcome {
        self.inner.process_reconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    /// Number of reconnect cycles started so far.
    pub fn cycle_count(&self) -> usize {
        self.inner.cycles.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.inner.connection.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.inner.connection.subscribe_state()
    }

    /// Topics subscribed and acknowledged at least once.
    pub async fn topics(&self) -> Vec<String> {
        self.inner.tracker.topics().await
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner.connection.current_endpoint()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Stops cycles and timers, closes the link and stops the event task.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        info!("Shutting down session");
        self.inner.cancel.cancel();
        self.inner.timer.cancel().await;

        let result = self.disconnect_and_wait().await;

        self.inner.events_cancel.cancel();
        self.inner
            .connection
            .update_state(SessionState::Disconnected);
        info!("Session shutdown completed");
        result
    }
}
