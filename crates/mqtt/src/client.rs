//! `rumqttc` binding of the [`Transport`] seam.
//!
//! Two pieces live here:
//!
//! - `ClientBuilder` turns the session [`Config`] plus a freshly resolved
//!   [`Endpoint`] into an `AsyncClient`/`EventLoop` pair speaking MQTT over
//!   secure websockets, with the configured certificate policy and proxy.
//! - `RumqttTransport` owns the current client, runs one pump task per link
//!   that drives the event loop, and translates rumqttc events into
//!   [`TransportEvent`]s.
//!
//! rumqttc retries on its own when its event loop is polled after an error.
//! The pump stops at the first error instead, so all retry decisions stay with
//! the session engine.
//!
//! # Request ids
//!
//! rumqttc assigns packet ids inside the event loop, after `subscribe()` has
//! returned. The transport therefore hands out its own [`RequestId`]s and binds
//! them to packet ids when the SUBSCRIBE leaves the client: requests are queued
//! in send order, and each `Outgoing::Subscribe(pkid)` takes the oldest one.
//!
//! ```ignore
//! let transport = RumqttTransport::new(config);
//! transport.attach(sink);
//! transport.connect(&endpoint).await?;
//! let id = transport.subscribe("prd/app_subscriptions/dev-1/#").await?;
//! ```

use std::{
    collections::{HashMap, VecDeque},
    fs,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Proxy, ProxyAuth, ProxyType, QoS, SubscribeReasonCode, TlsConfiguration,
    Transport as WireTransport,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use super::{
    config::{Config, ProxyConfig, TlsConfig},
    connection_info::Endpoint,
    error::SessionError,
    transport::{EventSink, RequestId, Transport, TransportEvent},
};

/// Builds a rumqttc client for one websocket link.
pub struct ClientBuilder {
    opts: MqttOptions,

    /// Capacity of the client request channel.
    cap: usize,

    verify_tls: bool,

    /// Custom trust anchors, used only when verification is on.
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Creates a builder for `endpoint` using the session configuration.
    ///
    /// An empty `client_id` is replaced with a random UUID.
    pub fn from_config(config: &Config, endpoint: &Endpoint) -> Result<Self, SessionError> {
        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let port = endpoint.port.unwrap_or(config.port);
        let mut opts = MqttOptions::new(client_id, endpoint.to_wss_url(config.port), port);

        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        // The broker keeps nothing for us; topics are restored by the engine.
        opts.set_clean_session(true);
        opts.set_inflight(config.max_inflight);

        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        if let Some(proxy) = &config.proxy {
            opts.set_proxy(http_proxy(proxy));
        }

        let tls_config = config.tls.clone().filter(TlsConfig::is_enabled);

        Ok(Self {
            opts,
            cap: config.request_channel_capacity,
            verify_tls: config.verify_tls,
            tls_config,
        })
    }

    fn load_file(path: &str) -> Result<Vec<u8>, SessionError> {
        Ok(fs::read(path)?)
    }

    /// Selects the TLS setup of the websocket.
    ///
    /// - verification off: accept any server certificate
    /// - custom CA configured: trust that CA, optionally with client auth
    /// - otherwise: the platform's native roots
    fn build_tls_config(&self) -> Result<TlsConfiguration, SessionError> {
        if !self.verify_tls {
            warn!("TLS certificate verification is disabled");
            return Ok(TlsConfiguration::Rustls(Arc::new(insecure_client_config())));
        }

        let Some(tls_config) = self.tls_config.as_ref() else {
            return Ok(TlsConfiguration::default());
        };

        tls_config
            .validate_config()
            .map_err(|e| SessionError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| SessionError::ClientSetup("CA certificate path is not set".into()))?;
        let ca = Self::load_file(ca_path)?;

        let client_auth = match (
            tls_config.client_cert_path.as_deref(),
            tls_config.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        Ok(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        })
    }

    /// Constructs the client and its event loop.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), SessionError> {
        let tls = self.build_tls_config()?;

        let mut opts = self.opts;
        opts.set_transport(WireTransport::Wss(tls));

        Ok(AsyncClient::new(opts, self.cap))
    }
}

fn http_proxy(proxy: &ProxyConfig) -> Proxy {
    Proxy {
        ty: ProxyType::Http,
        auth: ProxyAuth::None,
        addr: proxy.host.clone(),
        port: proxy.port,
    }
}

/// Accepts every server certificate.
#[derive(Debug)]
struct NoCertificateVerification {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

fn insecure_client_config() -> ClientConfig {
    let schemes = rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes();

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification { schemes }))
        .with_no_client_auth()
}

/// State shared between the transport and its pump task.
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    next_id: AtomicU64,

    /// Request ids whose SUBSCRIBE has not left the client yet, in send order.
    unbound: StdMutex<VecDeque<RequestId>>,

    /// Packet id -> request id, for SUBSCRIBEs awaiting their SUBACK.
    bound: StdMutex<HashMap<u16, RequestId>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Forgets every id of the previous link; the new broker session has no
    /// memory of them.
    fn reset(&self) {
        self.connected.store(false, Ordering::Release);
        lock(&self.unbound).clear();
        lock(&self.bound).clear();
    }
}

/// [`Transport`] backed by rumqttc over secure websockets.
pub struct RumqttTransport {
    config: Config,
    shared: Arc<Shared>,
    sink: OnceLock<EventSink>,
    client: Mutex<Option<AsyncClient>>,
    pump: StdMutex<Option<JoinHandle<()>>>,

    /// Serializes "queue id, send SUBSCRIBE" so the id queue matches the
    /// order requests reach the event loop.
    send_order: Mutex<()>,
}

impl RumqttTransport {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            sink: OnceLock::new(),
            client: Mutex::new(None),
            pump: StdMutex::new(None),
            send_order: Mutex::new(()),
        }
    }

    async fn current_client(&self) -> Result<AsyncClient, SessionError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    fn attach(&self, sink: EventSink) {
        if self.sink.set(sink).is_err() {
            warn!("Transport already has an event sink, keeping the first one");
        }
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<(), SessionError> {
        let sink = self
            .sink
            .get()
            .cloned()
            .ok_or_else(|| SessionError::ClientSetup("transport has no event sink".into()))?;

        let (client, event_loop) = ClientBuilder::from_config(&self.config, endpoint)?.build()?;

        let _order = self.send_order.lock().await;
        if let Some(previous) = lock(&self.pump).take() {
            previous.abort();
        }
        self.shared.reset();
        *self.client.lock().await = Some(client);

        info!("Connecting to {}", endpoint.host);
        let handle = tokio::spawn(pump(event_loop, self.shared.clone(), sink));
        *lock(&self.pump) = Some(handle);

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        let client = self.current_client().await?;
        client.disconnect().await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<RequestId, SessionError> {
        let client = self.current_client().await?;

        let _order = self.send_order.lock().await;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.shared.unbound).push_back(id);

        if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
            // Never reached the event loop, so it is still the newest entry.
            lock(&self.shared.unbound).pop_back();
            return Err(SessionError::SubscribeRejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }

        trace!("SUBSCRIBE {} queued as request {}", topic, id);
        Ok(id)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

/// Drives one link until it ends.
async fn pump(mut event_loop: EventLoop, shared: Arc<Shared>, sink: EventSink) {
    loop {
        match event_loop.poll().await {
            Ok(event) => {
                if !handle_event(event, &shared, &sink) {
                    break;
                }
            }
            Err(e) => {
                let was_connected = shared.connected.swap(false, Ordering::AcqRel);
                let reason = get_error_message(&e);
                match e {
                    ConnectionError::ConnectionRefused(code) => {
                        let _ = sink.send(TransportEvent::ConnAck {
                            success: false,
                            code: format!("{code:?}"),
                        });
                    }
                    _ if was_connected => {
                        let _ = sink.send(TransportEvent::Disconnected {
                            reason: Some(reason),
                        });
                    }
                    _ => debug!("Connection attempt failed: {}", reason),
                }
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    debug!("Event loop pump stopped");
}

/// Translates one rumqttc event. Returns false once the link is over.
fn handle_event(event: Event, shared: &Shared, sink: &EventSink) -> bool {
    match event {
        Event::Incoming(packet) => match packet {
            Packet::ConnAck(conn_ack) => {
                let success = conn_ack.code == ConnectReturnCode::Success;
                shared.connected.store(success, Ordering::Release);
                let _ = sink.send(TransportEvent::ConnAck {
                    success,
                    code: format!("{:?}", conn_ack.code),
                });
            }
            Packet::SubAck(sub_ack) => {
                let id = lock(&shared.bound).remove(&sub_ack.pkid);
                match id {
                    Some(id) => {
                        let granted = sub_ack
                            .return_codes
                            .iter()
                            .map(|code| match code {
                                SubscribeReasonCode::Success(qos) => Some(*qos as u8),
                                SubscribeReasonCode::Failure => None,
                            })
                            .collect();
                        let _ = sink.send(TransportEvent::SubAck { id, granted });
                    }
                    None => debug!("SUBACK for unknown packet id {}", sub_ack.pkid),
                }
            }
            Packet::Publish(publish) => {
                trace!("Received publish on topic {}", publish.topic);
                let _ = sink.send(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                });
            }
            Packet::Disconnect => {
                warn!("Disconnected by broker");
                shared.connected.store(false, Ordering::Release);
                let _ = sink.send(TransportEvent::Disconnected {
                    reason: Some("disconnected by broker".into()),
                });
                return false;
            }
            _ => {}
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Subscribe(pkid) => {
                let id = lock(&shared.unbound).pop_front();
                match id {
                    Some(id) => {
                        lock(&shared.bound).insert(pkid, id);
                    }
                    None => debug!("SUBSCRIBE {} left without a request id", pkid),
                }
            }
            Outgoing::Disconnect => {
                shared.connected.store(false, Ordering::Release);
                let _ = sink.send(TransportEvent::Disconnected {
                    reason: Some("client disconnected".into()),
                });
                return false;
            }
            other => trace!("Outgoing packet: {:?}", other),
        },
    }
    true
}

/// Extracts the innermost error message from an error chain.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
