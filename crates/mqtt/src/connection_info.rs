//! Resolution of the session endpoint.
//!
//! The broker address is not static: every connect asks the cloud API for a
//! fresh, pre-signed websocket URL. This module defines the collaborator that
//! does so ([`ConnectionInfoProvider`]) and two implementations:
//!
//! - [`IotPolicyClient`]: the authenticated `iot_policy` call, made through a
//!   [`CredentialProvider`] that owns login and token refresh.
//! - [`StaticConnectionInfo`]: a fixed URL, for deployments that already have
//!   one and for tests.

use std::error::Error as StdError;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::error::ConnectionInfoError;

/// Host, optional port and path (query included) of the websocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Endpoint {
    /// Parses a `wss://<host>[:port]/mqtt?...` URL.
    ///
    /// The scheme must be `wss` and the path must start with `/mqt`; the query
    /// string carries the signature and is kept as part of the path.
    pub fn from_wss_url(raw: &str) -> Result<Self, ConnectionInfoError> {
        let url = Url::parse(raw)
            .map_err(|e| ConnectionInfoError::MalformedUrl(format!("{raw}: {e}")))?;

        if url.scheme() != "wss" {
            return Err(ConnectionInfoError::MalformedUrl(format!(
                "{raw}: expected wss scheme"
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConnectionInfoError::MalformedUrl(format!("{raw}: missing host")))?;

        if !url.path().starts_with("/mqt") {
            return Err(ConnectionInfoError::MalformedUrl(format!(
                "{raw}: unexpected path {}",
                url.path()
            )));
        }

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            host: host.to_string(),
            port: url.port(),
            path,
        })
    }

    /// Full websocket URL, using `default_port` when the endpoint has none.
    pub fn to_wss_url(&self, default_port: u16) -> String {
        format!(
            "wss://{}:{}{}",
            self.host,
            self.port.unwrap_or(default_port),
            self.path
        )
    }
}

/// The "fetch connection info" collaborator.
#[async_trait]
pub trait ConnectionInfoProvider: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Endpoint, ConnectionInfoError>;
}

/// Logged-in account able to issue authenticated API requests.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    fn username(&self) -> &str;

    /// Performs an authenticated request and returns the decoded JSON body.
    /// Non-2xx responses must be reported as errors.
    async fn request(
        &self,
        method: &str,
        url: &str,
    ) -> Result<Value, Box<dyn StdError + Send + Sync>>;
}

/// Fetches the endpoint from `POST {api_base}/users/{username}/iot_policy`.
pub struct IotPolicyClient<C> {
    api_base: String,
    credentials: C,
}

impl<C: CredentialProvider> IotPolicyClient<C> {
    pub fn new(api_base: impl Into<String>, credentials: C) -> Self {
        Self {
            api_base: api_base.into(),
            credentials,
        }
    }

    /// The policy URL, with the username form-encoded.
    pub fn policy_url(&self) -> Result<String, ConnectionInfoError> {
        let base = Url::parse(&self.api_base)
            .map_err(|e| ConnectionInfoError::Request(format!("invalid API base: {e}")))?;

        let user: String =
            url::form_urlencoded::byte_serialize(self.credentials.username().as_bytes()).collect();

        Ok(format!(
            "{}/users/{}/iot_policy",
            base.as_str().trim_end_matches('/'),
            user
        ))
    }
}

#[async_trait]
impl<C: CredentialProvider> ConnectionInfoProvider for IotPolicyClient<C> {
    async fn fetch(&self) -> Result<Endpoint, ConnectionInfoError> {
        let url = self.policy_url()?;
        debug!("Requesting IoT policy from {}", url);

        let body = self
            .credentials
            .request("POST", &url)
            .await
            .map_err(|e| ConnectionInfoError::Request(e.to_string()))?;

        let wss_url = body
            .get("wss_url")
            .and_then(Value::as_str)
            .ok_or(ConnectionInfoError::MissingField("wss_url"))?;

        Endpoint::from_wss_url(wss_url)
    }
}

/// Serves the same endpoint on every fetch.
#[derive(Debug, Clone)]
pub struct StaticConnectionInfo {
    endpoint: Endpoint,
}

impl StaticConnectionInfo {
    pub fn new(wss_url: &str) -> Result<Self, ConnectionInfoError> {
        Ok(Self {
            endpoint: Endpoint::from_wss_url(wss_url)?,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl ConnectionInfoProvider for StaticConnectionInfo {
    async fn fetch(&self) -> Result<Endpoint, ConnectionInfoError> {
        Ok(self.endpoint.clone())
    }
}
