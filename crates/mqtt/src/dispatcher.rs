//! Inbound message dispatch and application handlers.
//!
//! Payloads are decoded as JSON. Topics of the form
//! `prd/app_subscriptions/<entity-id>/...` carry the id of the device they
//! concern; it is handed to update handlers as the routing key. Any other
//! topic is delivered with no routing key.
//!
//! Every handler call runs in its own task. A slow handler therefore holds up
//! neither the other handlers nor later messages, and a failing one is only
//! logged.

use std::{collections::HashMap, error::Error as StdError, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Prefix of entity-scoped topics.
pub const APP_SUBSCRIPTIONS_PREFIX: &str = "prd/app_subscriptions/";

pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Which session event a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Connected,
    Disconnected,
    Update,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Connected => "connected",
            HandlerKind::Disconnected => "disconnected",
            HandlerKind::Update => "update",
        }
    }
}

impl FromStr for HandlerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" | "connect" => Ok(HandlerKind::Connected),
            "disconnected" | "disconnect" => Ok(HandlerKind::Disconnected),
            "update" | "message" => Ok(HandlerKind::Update),
            other => Err(format!("unknown handler kind '{other}'")),
        }
    }
}

/// Application callbacks. Implement only the events you care about.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_connected(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_disconnected(&self, _reason: &str) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A decoded message. `entity_id` is the routing key, if the topic has one.
    async fn on_update(
        &self,
        _entity_id: Option<&str>,
        _payload: &Value,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handlers per kind, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<HandlerKind, Vec<Arc<dyn SessionHandler>>>>,
}

fn same_handler(a: &Arc<dyn SessionHandler>, b: &Arc<dyn SessionHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl HandlerRegistry {
    /// Registers `handler` for `kind`. Returns false if that same handler
    /// instance was already registered for it.
    pub async fn register(&self, kind: HandlerKind, handler: Arc<dyn SessionHandler>) -> bool {
        let mut handlers = self.handlers.write().await;
        let list = handlers.entry(kind).or_default();
        if list.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    pub async fn handlers(&self, kind: HandlerKind) -> Vec<Arc<dyn SessionHandler>> {
        self.handlers
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self, kind: HandlerKind) -> usize {
        self.handlers.read().await.get(&kind).map_or(0, Vec::len)
    }
}

/// Entity id carried by an `prd/app_subscriptions/<entity-id>/...` topic.
pub fn routing_key(topic: &str) -> Option<&str> {
    if !topic.starts_with(APP_SUBSCRIPTIONS_PREFIX) {
        return None;
    }
    topic.split('/').nth(2).filter(|segment| !segment.is_empty())
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Decodes one inbound message and fans it out to the update handlers.
    ///
    /// Returns how many handlers were started; undecodable payloads are
    /// dropped and start none.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        debug!(
            "Message received on {}: {}",
            topic,
            String::from_utf8_lossy(payload)
        );

        let data: Value = match serde_json::from_slice(payload) {
            Ok(data) => data,
            Err(e) => {
                info!("Received invalid JSON message on {}: {}", topic, e);
                return 0;
            }
        };

        let entity_id = routing_key(topic).map(str::to_string);
        let data = Arc::new(data);
        let handlers = self.registry.handlers(HandlerKind::Update).await;

        for handler in &handlers {
            let handler = handler.clone();
            let entity_id = entity_id.clone();
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.on_update(entity_id.as_deref(), &data).await {
                    warn!("Update handler failed: {}", e);
                }
            });
        }
        handlers.len()
    }

    pub async fn notify_connected(&self) {
        for handler in self.registry.handlers(HandlerKind::Connected).await {
            tokio::spawn(async move {
                if let Err(e) = handler.on_connected().await {
                    warn!("Connected handler failed: {}", e);
                }
            });
        }
    }

    pub async fn notify_disconnected(&self, reason: &str) {
        for handler in self.registry.handlers(HandlerKind::Disconnected).await {
            let reason = reason.to_string();
            tokio::spawn(async move {
                if let Err(e) = handler.on_disconnected(&reason).await {
                    warn!("Disconnected handler failed: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::test_support::RecordingHandler;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(HandlerRegistry::default()))
    }

    struct StuckHandler;

    #[async_trait]
    impl SessionHandler for StuckHandler {
        async fn on_update(&self, _: Option<&str>, _: &Value) -> Result<(), HandlerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl SessionHandler for FailingHandler {
        async fn on_update(&self, _: Option<&str>, _: &Value) -> Result<(), HandlerError> {
            Err("handler exploded".into())
        }
    }

    #[test]
    fn test_routing_key_extraction() {
        assert_eq!(
            routing_key("prd/app_subscriptions/device-42/state"),
            Some("device-42")
        );
        assert_eq!(routing_key("prd/app_subscriptions/device-42"), Some("device-42"));
        assert_eq!(routing_key("some/other/topic"), None);
        assert_eq!(routing_key("prd/app_subscriptions/"), None);
        assert_eq!(routing_key("prd/app_subscriptions//state"), None);
    }

    #[test]
    fn test_handler_kind_from_str() {
        assert_eq!("update".parse::<HandlerKind>(), Ok(HandlerKind::Update));
        assert_eq!("connect".parse::<HandlerKind>(), Ok(HandlerKind::Connected));
        assert_eq!(
            "disconnected".parse::<HandlerKind>(),
            Ok(HandlerKind::Disconnected)
        );
        assert!("bogus".parse::<HandlerKind>().is_err());
    }

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let registry = HandlerRegistry::default();
        let (handler, _rx) = RecordingHandler::new();
        let handler: Arc<dyn SessionHandler> = handler;

        assert!(registry.register(HandlerKind::Update, handler.clone()).await);
        assert!(!registry.register(HandlerKind::Update, handler.clone()).await);
        assert!(registry.register(HandlerKind::Connected, handler).await);

        assert_eq!(registry.len(HandlerKind::Update).await, 1);
        assert_eq!(registry.len(HandlerKind::Connected).await, 1);
        assert_eq!(registry.len(HandlerKind::Disconnected).await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_delivers_routing_key_and_payload() {
        let dispatcher = dispatcher();
        let (handler, mut rx) = RecordingHandler::new();
        dispatcher
            .registry()
            .register(HandlerKind::Update, handler)
            .await;

        let started = dispatcher
            .dispatch(
                "prd/app_subscriptions/device-42/state",
                br#"{"flow": 1.5}"#,
            )
            .await;
        assert_eq!(started, 1);

        dispatcher.dispatch("some/other/topic", br#"[1, 2]"#).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            format!("update:Some(\"device-42\"):{}", json!({"flow": 1.5}))
        );
        assert_eq!(rx.recv().await.unwrap(), "update:None:[1,2]");
    }

    #[tokio::test]
    async fn test_invalid_json_is_dropped() {
        let dispatcher = dispatcher();
        let (handler, mut rx) = RecordingHandler::new();
        dispatcher
            .registry()
            .register(HandlerKind::Update, handler)
            .await;

        assert_eq!(dispatcher.dispatch("a/b", b"not json").await, 0);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stuck_or_failing_handler_does_not_block_others() {
        let dispatcher = dispatcher();
        let registry = dispatcher.registry().clone();
        registry
            .register(HandlerKind::Update, Arc::new(StuckHandler))
            .await;
        registry
            .register(HandlerKind::Update, Arc::new(FailingHandler))
            .await;
        let (handler, mut rx) = RecordingHandler::new();
        registry.register(HandlerKind::Update, handler).await;

        for n in 0..3 {
            let payload = format!("{{\"n\": {n}}}");
            let started = tokio::time::timeout(
                Duration::from_secs(1),
                dispatcher.dispatch("a/b", payload.as_bytes()),
            )
            .await
            .expect("dispatch must not wait for handlers");
            assert_eq!(started, 3);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "update:None:{\"n\":0}",
                "update:None:{\"n\":1}",
                "update:None:{\"n\":2}"
            ]
        );
    }

    #[tokio::test]
    async fn test_connected_and_disconnected_notifications() {
        let dispatcher = dispatcher();
        let (handler, mut rx) = RecordingHandler::new();
        let handler: Arc<dyn SessionHandler> = handler;
        let registry = dispatcher.registry().clone();
        registry
            .register(HandlerKind::Connected, handler.clone())
            .await;
        registry.register(HandlerKind::Disconnected, handler).await;

        dispatcher.notify_connected().await;
        assert_eq!(rx.recv().await.unwrap(), "connected");

        dispatcher.notify_disconnected("unknown").await;
        assert_eq!(rx.recv().await.unwrap(), "disconnected:unknown");
    }

    #[tokio::test]
    async fn test_no_handlers_registered() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.dispatch("a/b", b"{}").await, 0);
    }
}
