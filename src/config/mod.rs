//! Application configuration.
//!
//! The top-level `Config` aggregates the `[logger]`, `[session]`, `[endpoint]`
//! and `[subscriptions]` tables of one TOML file. It is loaded once at startup
//! and stays immutable afterwards.
//!
//! ```toml
//! [logger]
//! level = "info"
//! directives = ["rumqttc=warn"]
//!
//! [session]
//! client_id = "tidewatch-gw-01"
//!
//! [session.reconnect]
//! health_check_interval = 3600
//!
//! [endpoint]
//! wss_url = "wss://broker.example.com/mqtt?X-Amz-Signature=..."
//!
//! [subscriptions]
//! topics = ["prd/app_subscriptions/device-42/#"]
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tidewatch_mqtt::Endpoint;
use validator::{Validate, ValidationError};

use self::logger::LoggerConfig;

pub mod logger;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "TIDEWATCH_CONFIG";

/// Used when `TIDEWATCH_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tidewatch/config.toml";

/// Current UTC time for the pre-subscriber console macros.
#[doc(hidden)]
pub fn timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Console messages printed before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Settings of the MQTT session.
    #[validate(nested)]
    pub session: tidewatch_mqtt::Config,

    #[validate(nested)]
    pub endpoint: EndpointConfig,

    #[validate(nested)]
    pub subscriptions: SubscriptionsConfig,
}

/// Where the broker lives. Signed URLs expire, so this suits tests and
/// long-lived URLs only.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct EndpointConfig {
    #[validate(custom(function = "validate_wss_url"))]
    pub wss_url: String,
}

fn validate_wss_url(url: &str) -> Result<(), ValidationError> {
    Endpoint::from_wss_url(url).map(|_| ()).map_err(|e| {
        let mut err = ValidationError::new("invalid_wss_url");
        err.message = Some(e.to_string().into());
        err
    })
}

/// Topics subscribed once the first connection is up.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct SubscriptionsConfig {
    #[validate(custom(function = "validate_topics"))]
    pub topics: Vec<String>,
}

fn validate_topics(topics: &[String]) -> Result<(), ValidationError> {
    if let Some(bad) = topics
        .iter()
        .find(|t| t.is_empty() || t.contains('\0'))
    {
        let mut err = ValidationError::new("invalid_topic");
        err.message = Some(format!("Invalid topic filter: {:?}", bad).into());
        return Err(err);
    }
    Ok(())
}

impl Config {
    /// Locates the config file and loads it.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `TIDEWATCH_CONFIG` if set, else the default path if it exists.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        config.session.validate_all()?;
        Ok(config)
    }
}
