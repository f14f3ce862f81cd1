//! Scripted collaborators for unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::{
    connection_info::{ConnectionInfoProvider, Endpoint},
    dispatcher::{HandlerError, SessionHandler},
    error::{ConnectionInfoError, SessionError},
    transport::{EventSink, RequestId, Transport, TransportEvent},
};

/// What the mock does when asked to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Reports a successful connect ack.
    Accept,
    /// Reports a refused connect ack.
    Refuse,
    /// Never answers.
    Silent,
    /// `connect()` itself fails.
    Fail,
}

pub struct MockTransport {
    connected: AtomicBool,
    next_id: AtomicU64,
    sink: OnceLock<EventSink>,
    script: StdMutex<VecDeque<ConnectBehavior>>,
    fallback: StdMutex<ConnectBehavior>,
    auto_ack: AtomicBool,
    refuse_subscribes: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    history: StdMutex<Vec<String>>,
    sent_tx: mpsc::UnboundedSender<(RequestId, String)>,
    sent_rx: Mutex<mpsc::UnboundedReceiver<(RequestId, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            sink: OnceLock::new(),
            script: StdMutex::new(VecDeque::new()),
            fallback: StdMutex::new(ConnectBehavior::Accept),
            auto_ack: AtomicBool::new(false),
            refuse_subscribes: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            history: StdMutex::new(Vec::new()),
            sent_tx,
            sent_rx: Mutex::new(sent_rx),
        }
    }

    /// Behaviours for the next connects, in order; `fallback` afterwards.
    pub fn script(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.script.lock().unwrap().extend(behaviors);
    }

    pub fn set_fallback(&self, behavior: ConnectBehavior) {
        *self.fallback.lock().unwrap() = behavior;
    }

    /// Acknowledge every SUBSCRIBE as soon as it is sent.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn refuse_subscribes(&self, refuse: bool) {
        self.refuse_subscribes.store(refuse, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Every topic ever sent, in send order.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.get() {
            let _ = sink.send(event);
        }
    }

    /// Simulates the link dropping without being asked to.
    pub fn drop_link(&self, reason: Option<&str>) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Disconnected {
            reason: reason.map(str::to_string),
        });
    }

    pub async fn next_subscribe(&self) -> (RequestId, String) {
        self.sent_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock transport dropped")
    }

    pub async fn wait_for_subscribes(&self, n: usize) -> Vec<(RequestId, String)> {
        let mut sent = Vec::with_capacity(n);
        for _ in 0..n {
            sent.push(self.next_subscribe().await);
        }
        sent
    }

    /// Drains subscribes not yet consumed by a test.
    pub fn take_subscribes(&self) -> Vec<(RequestId, String)> {
        let mut rx = self.sent_rx.try_lock().expect("subscribe queue busy");
        let mut sent = Vec::new();
        while let Ok(item) = rx.try_recv() {
            sent.push(item);
        }
        sent
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn attach(&self, sink: EventSink) {
        let _ = self.sink.set(sink);
    }

    async fn connect(&self, _endpoint: &Endpoint) -> Result<(), SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());

        match behavior {
            ConnectBehavior::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                self.emit(TransportEvent::ConnAck {
                    success: true,
                    code: "Success".into(),
                });
            }
            ConnectBehavior::Refuse => self.emit(TransportEvent::ConnAck {
                success: false,
                code: "NotAuthorized".into(),
            }),
            ConnectBehavior::Silent => {}
            ConnectBehavior::Fail => {
                return Err(SessionError::ClientSetup("scripted connect failure".into()))
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        self.emit(TransportEvent::Disconnected {
            reason: Some("client disconnected".into()),
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<RequestId, SessionError> {
        if self.refuse_subscribes.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.history.lock().unwrap().push(topic.to_string());
        let _ = self.sent_tx.send((id, topic.to_string()));

        if self.auto_ack.load(Ordering::SeqCst) {
            self.emit(TransportEvent::SubAck {
                id,
                granted: vec![Some(0)],
            });
        }
        Ok(id)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// What the mock connection-info provider does on a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoBehavior {
    Ok,
    Fail,
    Hang,
    /// Succeeds after the given delay.
    Delay(Duration),
}

pub struct MockConnectionInfo {
    script: StdMutex<VecDeque<InfoBehavior>>,
    fetches: AtomicUsize,
}

impl MockConnectionInfo {
    pub fn new() -> Self {
        Self {
            script: StdMutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Behaviours for the next fetches; later fetches succeed.
    pub fn script(&self, behaviors: impl IntoIterator<Item = InfoBehavior>) {
        self.script.lock().unwrap().extend(behaviors);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn endpoint() -> Endpoint {
        Endpoint {
            host: "broker.test".into(),
            port: None,
            path: "/mqtt?sig=test".into(),
        }
    }
}

#[async_trait]
impl ConnectionInfoProvider for MockConnectionInfo {
    async fn fetch(&self) -> Result<Endpoint, ConnectionInfoError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(InfoBehavior::Ok);

        match behavior {
            InfoBehavior::Ok => Ok(Self::endpoint()),
            InfoBehavior::Fail => Err(ConnectionInfoError::MissingField("wss_url")),
            InfoBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(ConnectionInfoError::Request("unreachable".into()))
            }
            InfoBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Self::endpoint())
            }
        }
    }
}

/// Handler that reports every call as a line of text.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<String>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn on_connected(&self) -> Result<(), HandlerError> {
        let _ = self.tx.send("connected".into());
        Ok(())
    }

    async fn on_disconnected(&self, reason: &str) -> Result<(), HandlerError> {
        let _ = self.tx.send(format!("disconnected:{reason}"));
        Ok(())
    }

    async fn on_update(
        &self,
        entity_id: Option<&str>,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        let _ = self.tx.send(format!("update:{entity_id:?}:{payload}"));
        Ok(())
    }
}
