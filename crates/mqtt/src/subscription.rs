//! Subscription bookkeeping.
//!
//! The tracker keeps two things:
//!
//! - the **topic set**: every topic that was asked for and acknowledged at
//!   least once. It survives reconnects and is what gets restored after one.
//!   Nothing here ever removes a topic from it.
//! - the **pending acks**: one entry per SUBSCRIBE in flight, keyed by the
//!   transport's request id, optionally carrying the signal a verified
//!   subscribe is waiting on.
//!
//! Acks are matched strictly by request id, so concurrent subscribes may be
//! acknowledged in any order.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    error::SessionError,
    transport::{RequestId, Transport},
};

struct PendingAck {
    topic: String,
    done: Option<oneshot::Sender<()>>,
}

/// Outcome of restoring the topic set after a reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResubscribeReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl ResubscribeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SubscriptionTracker {
    transport: Arc<dyn Transport>,
    topics: RwLock<HashSet<String>>,
    pending: Mutex<HashMap<RequestId, PendingAck>>,
}

impl SubscriptionTracker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            topics: RwLock::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Sends the SUBSCRIBE and records it; returns without waiting for the ack.
    pub async fn subscribe(&self, topic: &str) -> Result<RequestId, SessionError> {
        info!("Attempting to subscribe to: {}", topic);
        self.send(topic, None).await
    }

    /// Sends the SUBSCRIBE and waits up to `timeout` for its ack.
    ///
    /// Fails with [`SessionError::SubscribeAckTimeout`] when no ack arrives in
    /// time, including when the request was discarded by a reconnect meanwhile.
    pub async fn subscribe_with_ack(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        let id = self.send(topic, Some(tx)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::SubscribeAckTimeout {
                    topic: topic.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn send(
        &self,
        topic: &str,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<RequestId, SessionError> {
        // Held across the send so the ack cannot be processed before the
        // entry exists.
        let mut pending = self.pending.lock().await;
        let id = self.transport.subscribe(topic).await?;
        pending.insert(
            id,
            PendingAck {
                topic: topic.to_string(),
                done,
            },
        );
        Ok(id)
    }

    /// Handles a SUBACK reported by the transport.
    pub async fn handle_ack(&self, id: RequestId, granted: &[Option<u8>]) {
        let Some(entry) = self.pending.lock().await.remove(&id) else {
            debug!("Ignoring ack for unknown request id {} {:?}", id, granted);
            return;
        };

        if granted.iter().any(Option::is_none) {
            warn!("Broker refused a filter of {}: {:?}", entry.topic, granted);
        }

        info!("Subscribed to: {}", entry.topic);
        self.topics.write().await.insert(entry.topic);

        if let Some(done) = entry.done {
            let _ = done.send(());
        }
    }

    /// Drops every pending entry. Waiters see their request as unanswered.
    pub async fn clear_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let stale = pending.len();
        if stale > 0 {
            debug!("Cleaning up {} stale pending acks", stale);
        }
        pending.clear();
        stale
    }

    /// Re-subscribes every topic of the set, one at a time, each verified by
    /// its ack. Failures are logged and reported, never returned.
    pub async fn resubscribe_all(&self, timeout: Duration) -> ResubscribeReport {
        let mut topics: Vec<String> = self.topics.read().await.iter().cloned().collect();
        topics.sort();

        let mut report = ResubscribeReport::default();
        for topic in topics {
            match self.subscribe_with_ack(&topic, timeout).await {
                Ok(()) => report.succeeded.push(topic),
                Err(e) => {
                    error!("Error re-subscribing to {}: {}", topic, e);
                    report.failed.push(topic);
                }
            }
        }

        if report.is_complete() {
            info!(
                "Successfully re-subscribed to all {} topics",
                report.succeeded.len()
            );
        } else {
            warn!(
                "Failed to re-subscribe to {} topics: {:?}",
                report.failed.len(),
                report.failed
            );
        }
        report
    }

    /// Snapshot of the topic set.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().await.iter().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().await.contains(topic)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTransport;

    fn tracker() -> (Arc<SubscriptionTracker>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let tracker = Arc::new(SubscriptionTracker::new(transport.clone()));
        (tracker, transport)
    }

    #[tokio::test]
    async fn test_ack_adds_topic_once() {
        let (tracker, _) = tracker();

        let first = tracker.subscribe("a/b").await.unwrap();
        let second = tracker.subscribe("a/b").await.unwrap();
        assert_ne!(first, second);

        tracker.handle_ack(first, &[Some(0)]).await;
        tracker.handle_ack(second, &[Some(0)]).await;

        assert_eq!(tracker.topics().await, vec!["a/b".to_string()]);
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_topic_not_added_before_ack() {
        let (tracker, _) = tracker();
        tracker.subscribe("a/b").await.unwrap();

        assert!(!tracker.is_subscribed("a/b").await);
        assert_eq!(tracker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_ack_is_ignored() {
        let (tracker, _) = tracker();
        tracker.handle_ack(999, &[Some(0)]).await;
        assert!(tracker.topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_acks_resolve_their_own_waiters_in_any_order() {
        let (tracker, transport) = tracker();
        let topics = ["t/0", "t/1", "t/2", "t/3", "t/4"];

        let waiters: Vec<_> = topics
            .iter()
            .map(|topic| {
                let tracker = tracker.clone();
                let topic = topic.to_string();
                tokio::spawn(async move {
                    tracker
                        .subscribe_with_ack(&topic, Duration::from_secs(5))
                        .await
                        .map(|()| topic)
                })
            })
            .collect();

        let mut sent = transport.wait_for_subscribes(topics.len()).await;
        // Acknowledge in a scrambled order.
        sent.reverse();
        sent.swap(0, 2);
        for (id, _) in &sent {
            tracker.handle_ack(*id, &[Some(0)]).await;
        }

        let mut resolved = Vec::new();
        for waiter in waiters {
            resolved.push(waiter.await.unwrap().unwrap());
        }
        assert_eq!(resolved, topics.map(String::from).to_vec());
        assert_eq!(tracker.topics().await.len(), topics.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_with_ack_times_out() {
        let (tracker, _) = tracker();

        let err = tracker
            .subscribe_with_ack("slow/topic", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::SubscribeAckTimeout { ref topic, .. } if topic == "slow/topic"
        ));
        assert_eq!(tracker.pending_count().await, 0);
        assert!(!tracker.is_subscribed("slow/topic").await);
    }

    #[tokio::test]
    async fn test_clear_pending_releases_waiters() {
        let (tracker, transport) = tracker();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .subscribe_with_ack("a/b", Duration::from_secs(3600))
                    .await
            })
        };
        transport.wait_for_subscribes(1).await;

        assert_eq!(tracker.clear_pending().await, 1);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(SessionError::SubscribeAckTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_refusal_is_returned() {
        let (tracker, transport) = tracker();
        transport.refuse_subscribes(true);

        assert!(matches!(
            tracker.subscribe("a/b").await,
            Err(SessionError::NotConnected)
        ));
        assert_eq!(tracker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_resubscribe_reports_partial_success() {
        let (tracker, transport) = tracker();
        for topic in ["a", "b", "c"] {
            let id = tracker.subscribe(topic).await.unwrap();
            tracker.handle_ack(id, &[Some(0)]).await;
        }
        transport.take_subscribes();

        // Acknowledge everything except "b".
        let acker = {
            let tracker = tracker.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    let (id, topic) = transport.next_subscribe().await;
                    if topic != "b" {
                        tracker.handle_ack(id, &[Some(0)]).await;
                    }
                }
            })
        };

        let report = tracker.resubscribe_all(Duration::from_millis(200)).await;
        acker.await.unwrap();

        assert_eq!(report.succeeded, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(report.failed, vec!["b".to_string()]);
        assert!(!report.is_complete());
        assert_eq!(tracker.topics().await.len(), 3);
    }
}
