//! # tidewatch-mqtt: push-notification session for the telemetry service
//!
//! Keeps one MQTT session open to the telemetry broker over secure
//! websockets and delivers device updates to the application. The broker
//! endpoint is short-lived and signed, so every connect and every reconnect
//! first asks a connection-info provider for a fresh one.
//!
//! On top of `rumqttc` this crate adds:
//!
//! - **Reconnect cycles** with a banded backoff (immediate, 2 s, 10 s, 60 s)
//!   and a hard attempt limit per cycle
//! - **Subscription restoration**: acknowledged topics survive reconnects
//! - **Ack correlation** by request id, so concurrent subscribes may be
//!   acknowledged in any order
//! - **Connect watchdog** and an hourly **health reconnect**
//! - **Handler dispatch** of decoded JSON updates, keyed by entity id
//! - **State monitoring** over a `watch` channel
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tidewatch_mqtt::{Config, HandlerKind, SessionManager, StaticConnectionInfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(StaticConnectionInfo::new(
//!         "wss://broker.example.com/mqtt?X-Amz-Signature=...",
//!     )?);
//!
//!     let session = SessionManager::from_config(Config::default())?
//!         .build_and_start(provider)
//!         .await?;
//!
//!     session.add_event_handler(HandlerKind::Update, my_handler).await;
//!     session.connect().await?;
//!     session.subscribe("prd/app_subscriptions/device-42/#").await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Session (engine, timer, handlers)    │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │ ConnectionManager  SubscriptionTracker│
//! │ Dispatcher         Backoff            │
//! └────────────┬─────────────────────────┘
//!              │ Transport trait + event channel
//! ┌────────────▼─────────────────────────┐
//! │ RumqttTransport (rumqttc over WSS)   │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──(CONNACK)──> Connected
//!       ▲                                                  │
//!       │                                           (link dropped)
//!       │                                                  ▼
//!   GivingUp <──(attempts used up)── Reconnecting{attempt, delay}
//! ```
//!
//! # Configuration
//!
//! ```toml
//! client_id = "tidewatch-7f3c"
//! keep_alive = 60
//!
//! [reconnect]
//! max_attempts = 20
//! health_check_interval = 3600
//! ```

// Module declarations
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod connection_info;
pub mod dispatcher;
pub mod error;
pub mod session;
pub mod state;
pub mod subscription;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-exports: Configuration
pub use config::{Config, ProxyConfig, ReconnectConfig, TlsConfig};
// Re-exports: Endpoint lookup
//
// Applications provide one of these to the session
pub use connection_info::{
    ConnectionInfoProvider, CredentialProvider, Endpoint, IotPolicyClient, StaticConnectionInfo,
};
// Re-exports: Handlers
pub use dispatcher::{HandlerError, HandlerKind, SessionHandler};
// Re-exports: Error handling
pub use error::{ConnectionInfoError, SessionError};
// Re-exports: High-level types
//
// These are the entry points for applications
pub use session::{CycleOutcome, Session, SessionManager};
pub use state::SessionState;
pub use subscription::ResubscribeReport;
// Re-exports: Transport seam
//
// Alternative transports (or test doubles) implement this
pub use transport::{RequestId, Transport, TransportEvent};

/// Result type for session operations.
///
/// An alias for `std::result::Result<T, SessionError>`.
///
/// ```ignore
/// async fn watch_device(session: &Session, id: &str) -> tidewatch_mqtt::Result<()> {
///     let topic = format!("prd/app_subscriptions/{id}/#");
///     session.subscribe_with_ack(&topic, Duration::from_secs(5)).await
/// }
/// ```
pub type Result<T> = std::result::Result<T, SessionError>;
