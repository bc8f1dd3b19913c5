//! Fleet-wide invalidation signalling.
//!
//! # Data Flow
//! ```text
//! successful write
//!     → publish(topic, {key, environment})
//!     → every subscribed instance drops the matching L1 entries
//! ```
//!
//! # Design Decisions
//! - Delivery is best-effort. A lost message is bounded by the L1 TTL
//! - A receiver that falls behind gets [`BusEvent::Overflow`] and must clear
//!   its whole L1 for that topic
//! - Handlers run on the subscription task and must not block

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Payload published after every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub key: String,
    pub environment: String,
}

impl InvalidationMessage {
    pub fn new(key: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            environment: environment.into(),
        }
    }
}

/// What a subscriber sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Invalidate(InvalidationMessage),
    /// Messages were dropped before this subscriber read them.
    Overflow { missed: u64 },
}

pub type InvalidationHandler = Arc<dyn Fn(BusEvent) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("invalidation bus unavailable: {0}")]
    Unavailable(String),

    #[error("publish to '{0}' timed out")]
    Timeout(String),
}

/// Publish/subscribe primitive used only for cache invalidation.
#[async_trait]
pub trait InvalidationBus: Send + Sync + fmt::Debug {
    async fn publish(&self, topic: &str, message: InvalidationMessage) -> Result<(), BusError>;

    /// Register a handler. Delivery stops when the returned guard drops.
    fn subscribe(&self, topic: &str, handler: InvalidationHandler) -> Result<Subscription, BusError>;
}

/// Live subscription. Dropping it stops delivery.
pub struct Subscription {
    topic: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// In-process bus on tokio broadcast channels, one per topic.
///
/// Every [`Subscription`] sees every message published after it subscribed,
/// which models a fleet of peers sharing one process in tests.
#[derive(Debug)]
pub struct BroadcastBus {
    topics: DashMap<String, broadcast::Sender<InvalidationMessage>>,
    capacity: usize,
    available: AtomicBool,
    dropping: AtomicBool,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
            dropping: AtomicBool::new(false),
        }
    }

    /// Failure injection: publishes fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Failure injection: publishes succeed but nothing is delivered.
    pub fn drop_messages(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<InvalidationMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl InvalidationBus for BroadcastBus {
    async fn publish(&self, topic: &str, message: InvalidationMessage) -> Result<(), BusError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("injected outage".into()));
        }
        if self.dropping.load(Ordering::SeqCst) {
            tracing::debug!(topic, key = %message.key, "Dropping invalidation message");
            return Ok(());
        }
        // No receivers is not an error: nobody has anything cached.
        let _ = self.sender(topic).send(message);
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: InvalidationHandler) -> Result<Subscription, BusError> {
        let mut rx = self.sender(topic).subscribe();
        let topic_name = topic.to_string();
        let task_topic = topic_name.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(BusEvent::Invalidate(message)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(topic = %task_topic, missed, "Invalidation subscriber lagged");
                        handler(BusEvent::Overflow { missed });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription {
            topic: topic_name,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn forwarding_handler() -> (InvalidationHandler, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: InvalidationHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = BroadcastBus::new(16);
        let (h1, mut rx1) = forwarding_handler();
        let (h2, mut rx2) = forwarding_handler();
        let _s1 = bus.subscribe("config", h1).unwrap();
        let _s2 = bus.subscribe("config", h2).unwrap();

        let msg = InvalidationMessage::new("checkout.maxRetries", "staging");
        bus.publish("config", msg.clone()).await.unwrap();

        assert_eq!(rx1.recv().await, Some(BusEvent::Invalidate(msg.clone())));
        assert_eq!(rx2.recv().await, Some(BusEvent::Invalidate(msg)));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = BroadcastBus::new(16);
        let (handler, mut rx) = forwarding_handler();
        let _sub = bus.subscribe("flags", handler).unwrap();

        bus.publish("config", InvalidationMessage::new("a", "global"))
            .await
            .unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = BroadcastBus::new(16);
        let (handler, mut rx) = forwarding_handler();
        let _sub = bus.subscribe("config", handler).unwrap();

        bus.drop_messages(true);
        bus.publish("config", InvalidationMessage::new("a", "global"))
            .await
            .unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(waited.is_err());

        bus.set_available(false);
        assert!(bus
            .publish("config", InvalidationMessage::new("a", "global"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_delivery() {
        let bus = BroadcastBus::new(16);
        let (handler, mut rx) = forwarding_handler();
        let sub = bus.subscribe("config", handler).unwrap();
        assert_eq!(sub.topic(), "config");
        drop(sub);

        bus.publish("config", InvalidationMessage::new("a", "global"))
            .await
            .unwrap();
        // The aborted task drops its sender half, closing the channel.
        assert_eq!(rx.recv().await, None);
    }
}
