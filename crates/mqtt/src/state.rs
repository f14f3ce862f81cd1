//! Session state as seen by the reconnection engine.
//!
//! The engine publishes every transition on a `watch` channel, so application
//! code can follow the lifecycle without polling:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                                  |
//!                                  v
//!                           Reconnecting -> Connected
//!                                  |
//!                                  v
//!                              GivingUp -> Disconnected
//! ```
//!
//! # Examples
//!
//! ```ignore
//! let state = SessionState::Reconnecting { attempt: 4, delay_secs: 10.0 };
//! println!("{state}"); // "Reconnecting (attempt 4, in 10 seconds)"
//! ```

use std::fmt;

/// Lifecycle state of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No link and no cycle running. Initial state, and where the engine
    /// returns after a requested disconnect or after giving up.
    Disconnected,

    /// An explicit connect was issued and the connect ack is pending.
    Connecting,

    /// The broker acknowledged the connection.
    Connected,

    /// A reconnect cycle is running. `attempt` is the attempt about to be made
    /// (1-based), `delay_secs` the wait that precedes it.
    Reconnecting { attempt: u32, delay_secs: f64 },

    /// The cycle used all its attempts. Transient: the engine moves on to
    /// `Disconnected` right after publishing it.
    GivingUp,
}

impl SessionState {
    /// Returns a short identifier for the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Reconnecting { .. } => "Reconnecting",
            SessionState::GivingUp => "GivingUp",
        }
    }

    /// Returns contextual details, empty for states that carry none.
    pub fn details(&self) -> String {
        match self {
            SessionState::Reconnecting {
                attempt,
                delay_secs,
            } => format!("attempt {attempt}, in {delay_secs} seconds"),
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// True while the engine is working towards a link.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Reconnecting { .. }
        )
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Disconnected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
