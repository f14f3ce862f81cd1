//! Configuration for the MQTT session.
//!
//! Every struct here deserializes with `serde` (all fields defaulted) and is
//! checked with the `validator` crate, so a bad value fails when the config is
//! loaded rather than at the first connect.
//!
//! ```toml
//! client_id = "tidewatch-gw-01"
//! port = 443
//! verify_tls = true
//!
//! [proxy]
//! host = "proxy.lan"
//! port = 3128
//!
//! [reconnect]
//! max_attempts = 20
//! short_delay = 2
//! medium_delay = 10
//! long_delay = 60
//! ```
//!
//! The endpoint host and path are not configured here: they are fetched fresh
//! from the connection-info collaborator on every connect.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Main session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// MQTT client identifier presented to the broker.
    ///
    /// Defaults to a random UUID so two processes never collide.
    #[validate(length(
        min = 1,
        max = 36,
        message = "Client ID must be between 1 and 36 characters"
    ))]
    pub client_id: String,

    /// Websocket port, used when the endpoint URL does not carry one.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Maximum MQTT packet size in bytes, applied to both directions.
    #[validate(range(
        min = 64,
        max = 268435455,
        message = "Max packet size must be between 64 bytes and 256MB"
    ))]
    pub max_packet_size: Option<u32>,

    /// Maximum number of unacknowledged outgoing QoS>0 packets.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Capacity of the client request channel.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Verify the broker certificate. Turning this off accepts any certificate.
    pub verify_tls: bool,

    /// Optional HTTP proxy the websocket is tunnelled through.
    #[validate(nested)]
    pub proxy: Option<ProxyConfig>,

    /// Optional custom trust anchors (and client auth) for the broker.
    ///
    /// Without it the platform's native roots are used.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    /// Reconnect engine tuning.
    #[validate(nested)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_id: Uuid::new_v4().to_string(),
            port: 443,
            keep_alive: 60,
            max_packet_size: Some(262_144),
            max_inflight: 10,
            request_channel_capacity: 16,
            verify_tls: true,
            proxy: None,
            tls: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// HTTP proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct ProxyConfig {
    #[validate(length(
        min = 1,
        max = 255,
        message = "Proxy host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Proxy port must be between 1 and 65535"))]
    pub port: u16,
}

/// Timing and limits of the reconnection engine. All durations in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts per reconnect cycle before giving up.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max attempts must be between 1 and 1000"
    ))]
    pub max_attempts: u32,

    /// Wait between the first few attempts.
    pub short_delay: u64,

    /// Wait once more than `medium_after` attempts were made.
    pub medium_delay: u64,

    /// Wait once more than `long_after` attempts were made.
    pub long_delay: u64,

    pub medium_after: u32,

    #[validate(custom(function = "validate_nonzero_u32"))]
    pub long_after: u32,

    /// Bound on one connection-info lookup during a cycle.
    #[validate(range(min = 1, max = 300))]
    pub connection_info_timeout: u64,

    /// Bound on waiting for the connect ack after issuing a connect.
    #[validate(range(min = 1, max = 300))]
    pub connect_timeout: u64,

    /// Bound on waiting for each SUBACK while restoring topics.
    #[validate(range(min = 1, max = 300))]
    pub subscribe_ack_timeout: u64,

    /// Bound on waiting for a requested disconnect to complete.
    #[validate(range(min = 1, max = 300))]
    pub disconnect_timeout: u64,

    /// After an explicit connect, how long to wait for the ack before the
    /// watchdog forces a reconnect cycle.
    #[validate(range(min = 1, max = 3600))]
    pub connect_watchdog: u64,

    /// While connected, a reconnect cycle is forced after this long.
    #[validate(range(min = 60, max = 86400))]
    pub health_check_interval: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            short_delay: 2,
            medium_delay: 10,
            long_delay: 60,
            medium_after: 3,
            long_after: 6,
            connection_info_timeout: 5,
            connect_timeout: 2,
            subscribe_ack_timeout: 5,
            disconnect_timeout: 5,
            connect_watchdog: 5,
            health_check_interval: 3600,
        }
    }
}

impl ReconnectConfig {
    pub(crate) fn check_bands(&self) -> Result<(), ValidationError> {
        if self.medium_after > self.long_after {
            return Err(ValidationError::new("inverted_bands")
                .with_message("medium_after must not exceed long_after".into()));
        }
        if !(self.short_delay <= self.medium_delay && self.medium_delay <= self.long_delay) {
            return Err(ValidationError::new("decreasing_delays")
                .with_message("delays must satisfy short <= medium <= long".into()));
        }
        Ok(())
    }
}

fn validate_nonzero_u32(value: u32) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::new("zero").with_message("must be greater than 0".into()));
    }
    Ok(())
}

/// Paths to PEM material for a custom trust anchor and optional client auth.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks the combination of paths, on top of the per-field checks.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }

        Ok(())
    }
}

impl Config {
    /// Validates field ranges plus the cross-field rules.
    pub fn validate_all(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;

        let mut errors = validator::ValidationErrors::new();
        if let Err(e) = self.reconnect.check_bands() {
            errors.add("reconnect", e);
        }
        if let Some(tls) = self.tls.as_ref().filter(|t| t.is_enabled()) {
            if let Err(e) = tls.validate_config() {
                errors.add("tls", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn validate_optional_file_exists(path: &str) -> Result<(), ValidationError> {
    validate_file_path(path)
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}
