//! Logging configuration.
//!
//! Loaded from the `[logger]` table of the application config and validated
//! with `validator` before the subscriber is built.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Base level: trace, debug, info, warn or error.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Extra filter directives such as `rumqttc=warn`, applied after `level`.
    #[validate(custom(function = "validate_directives"))]
    pub directives: Vec<String>,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

impl LoggerConfig {
    /// Filter string combining the level and the directives.
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.level.to_lowercase())
            .chain(self.directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn console_enabled(&self) -> bool {
        self.console.as_ref().is_some_and(|c| c.enabled)
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

fn validate_directives(directives: &[String]) -> Result<(), ValidationError> {
    for directive in directives {
        let valid = match directive.split_once('=') {
            Some((target, level)) => !target.is_empty() && validate_log_level(level).is_ok(),
            None => false,
        };
        if !valid {
            let mut err = ValidationError::new("invalid_directive");
            err.message =
                Some(format!("Directive must look like target=level: {}", directive).into());
            return Err(err);
        }
    }
    Ok(())
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            directives: Vec::new(),
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,

    /// Include the module path of each event.
    pub show_target: bool,
    pub show_thread_ids: bool,

    /// Log span close events with their timings.
    pub show_spans: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JournaldConfig {
    #[serde(default)]
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "tidewatch".to_string(),
        }
    }
}
