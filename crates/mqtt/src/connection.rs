//! Connection management on top of the transport.
//!
//! `ConnectionManager` holds the transport handle on behalf of the session and
//! keeps the connection-level signals the reconnection engine waits on:
//!
//! - the lifecycle [`SessionState`], broadcast on a `watch` channel
//! - a `connected` flag, raised when the broker acknowledges a connect
//! - the disconnect request: a flag plus a one-shot completion signal armed
//!   before a locally requested close
//!
//! ```text
//! Session / engine
//!     |
//! ConnectionManager (endpoint lookup, signals, state)
//!     |
//! Transport (rumqttc over secure websockets)
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError, RwLock,
    },
    time::Duration,
};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    connection_info::{ConnectionInfoProvider, Endpoint},
    error::{ConnectionInfoError, SessionError},
    state::SessionState,
    transport::Transport,
};

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    provider: Arc<dyn ConnectionInfoProvider>,

    /// Endpoint of the latest connect.
    endpoint: RwLock<Option<Endpoint>>,

    state_tx: watch::Sender<SessionState>,

    /// Raised by the connect ack, lowered by any disconnect.
    connected_tx: watch::Sender<bool>,

    /// Set while a locally requested close (or a proactive reconnect) is under way.
    disconnect_requested: AtomicBool,
    disconnect_signal: StdMutex<Option<oneshot::Sender<()>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, provider: Arc<dyn ConnectionInfoProvider>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (connected_tx, _) = watch::channel(false);
        Self {
            transport,
            provider,
            endpoint: RwLock::new(None),
            state_tx,
            connected_tx,
            disconnect_requested: AtomicBool::new(false),
            disconnect_signal: StdMutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fetches a fresh endpoint, bounded by `timeout`.
    pub async fn fetch_endpoint(&self, timeout: Duration) -> Result<Endpoint, ConnectionInfoError> {
        match tokio::time::timeout(timeout, self.provider.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionInfoError::Timeout(timeout)),
        }
    }

    /// Issues the transport connect for `endpoint`. The outcome arrives later
    /// as a transport event.
    pub async fn connect_to(&self, endpoint: &Endpoint) -> Result<(), SessionError> {
        *self
            .endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());

        info!("Connecting to mqtt websocket: {}", endpoint.host);
        self.transport.connect(endpoint).await
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Marks a disconnect as requested and arms the completion signal.
    pub fn request_disconnect(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.disconnect_requested.store(true, Ordering::Release);
        *self.lock_signal() = Some(tx);
        rx
    }

    /// Requests a graceful close and returns the completion signal.
    pub async fn disconnect(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        let done = self.request_disconnect();
        info!("MQTT client disconnecting...");
        self.transport.disconnect().await?;
        Ok(done)
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    /// Fires the completion signal if one is armed.
    pub fn resolve_disconnect(&self) {
        if let Some(done) = self.lock_signal().take() {
            let _ = done.send(());
        }
    }

    pub fn clear_disconnect_request(&self) {
        self.disconnect_requested.store(false, Ordering::Release);
        self.lock_signal().take();
    }

    fn lock_signal(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.disconnect_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Link state as reported by the transport.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected_tx.send_replace(connected);
    }

    /// Waits for the connect ack, bounded by `timeout` and aborted by `cancel`.
    pub async fn wait_connected(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let mut connected_rx = self.connected_tx.subscribe();
        let confirmed = async move { connected_rx.wait_for(|c| *c).await.map(|_| ()) };

        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = tokio::time::timeout(timeout, confirmed) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SessionError::NotConnected),
                Err(_) => Err(SessionError::ConnectTimeout(timeout)),
            },
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Publishes `state` if it differs from the current one.
    pub fn update_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });

        if changed {
            info!("Session state changed to: {}", state);
        } else {
            debug!("Session state unchanged: {}", state);
        }
    }
}
