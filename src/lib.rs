//! tidewatch: push-notification agent for IoT telemetry devices
//!
//! Keeps an MQTT session to the telemetry broker open over secure websockets
//! and logs the device updates pushed through it. The session itself lives in
//! the `tidewatch-mqtt` crate; this crate is the agent around it.
//!
//! ## Modules
//!
//! * `config`: TOML configuration: logger, session, endpoint and the topics
//!   to subscribe, validated with `validator`.
//! * `handler`: the session handler that logs pushed updates.
//! * `logger`: `tracing` subscriber setup (compact, pretty or JSON console
//!   output, optional systemd journald).

pub mod config;
pub mod handler;
pub mod logger;
