//! Session handler of the agent binary: logs what the broker pushes.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tidewatch_mqtt::{HandlerError, SessionHandler};
use tracing::{info, warn};

/// Logs connection changes and device updates.
#[derive(Default)]
pub struct LoggingHandler {
    updates: AtomicU64,
}

impl LoggingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates received so far.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionHandler for LoggingHandler {
    async fn on_connected(&self) -> Result<(), HandlerError> {
        info!("Push channel online");
        Ok(())
    }

    async fn on_disconnected(&self, reason: &str) -> Result<(), HandlerError> {
        warn!("Push channel offline: {}", reason);
        Ok(())
    }

    async fn on_update(&self, entity_id: Option<&str>, payload: &Value) -> Result<(), HandlerError> {
        self.updates.fetch_add(1, Ordering::Relaxed);
        match entity_id {
            Some(id) => info!(entity_id = id, "Device update: {}", payload),
            None => info!("Update without entity: {}", payload),
        }
        Ok(())
    }
}
