//! The seam between the session engine and the MQTT client library.
//!
//! A transport exposes connect, disconnect and subscribe, and reports what
//! happens on the link as [`TransportEvent`] values pushed into the sink it was
//! attached to. The session owns exactly one transport and one event task
//! consuming that sink, so there is no shared callback state.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{connection_info::Endpoint, error::SessionError};

/// Transport-assigned identifier of one SUBSCRIBE request.
///
/// Unique for the lifetime of the transport, so ids of overlapping requests
/// never collide.
pub type RequestId = u64;

/// What the transport reports about the link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Result of a connect handshake.
    ConnAck { success: bool, code: String },

    /// The link went down. `reason` is absent when the transport cannot tell.
    Disconnected { reason: Option<String> },

    /// A SUBSCRIBE was acknowledged. One granted QoS per requested filter,
    /// `None` where the broker refused the filter.
    SubAck {
        id: RequestId,
        granted: Vec<Option<u8>>,
    },

    /// An inbound PUBLISH.
    Message { topic: String, payload: Bytes },
}

pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sets where events are delivered. Called once, before the first connect.
    fn attach(&self, sink: EventSink);

    /// Starts connecting to `endpoint`. Returns once the attempt is under way;
    /// the outcome arrives as a [`TransportEvent::ConnAck`].
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), SessionError>;

    /// Requests a graceful close. Completion arrives as
    /// [`TransportEvent::Disconnected`].
    async fn disconnect(&self) -> Result<(), SessionError>;

    /// Sends a SUBSCRIBE for `topic` and returns its request id.
    async fn subscribe(&self, topic: &str) -> Result<RequestId, SessionError>;

    /// Link state as last reported by the client library.
    fn is_connected(&self) -> bool;
}
