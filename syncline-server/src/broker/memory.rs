//! In-process broker for tests and broker-less dev runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Broker, BrokerError};

/// Shared fan-out bus. Every [`MemoryBroker`] attached to the same bus sees
/// every publish, which lets tests model several relay processes sharing one
/// broker.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryBus {
    /// A fresh bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a broker view to this bus. Each view tracks its own
    /// subscriptions, like one process's broker connection would.
    #[must_use]
    pub fn broker(self: &Arc<Self>) -> MemoryBroker {
        MemoryBroker {
            bus: Arc::clone(self),
            mine: Mutex::new(HashMap::new()),
        }
    }

    /// Whether any attached broker holds a subscription for `channel`.
    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.topics
            .lock()
            .await
            .get(channel)
            .is_some_and(|senders| !senders.is_empty())
    }

    async fn send(&self, channel: &str, payload: &str) {
        let mut topics = self.topics.lock().await;
        if let Some(senders) = topics.get_mut(channel) {
            senders.retain(|sender| sender.send(payload.to_string()).is_ok());
            if senders.is_empty() {
                topics.remove(channel);
            }
        }
    }
}

/// One attachment to a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryBroker {
    bus: Arc<MemoryBus>,
    mine: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.bus.send(channel, payload).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut mine = self.mine.lock().await;
        if mine.contains_key(channel) {
            return Err(BrokerError::AlreadySubscribed(channel.to_string()));
        }
        self.bus
            .topics
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx.clone());
        mine.insert(channel.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let Some(tx) = self.mine.lock().await.remove(channel) else {
            return Ok(());
        };
        let mut topics = self.bus.topics.lock().await;
        if let Some(senders) = topics.get_mut(channel) {
            senders.retain(|sender| !sender.same_channel(&tx));
            if senders.is_empty() {
                topics.remove(channel);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_attached_broker() {
        let bus = MemoryBus::new();
        let first = bus.broker();
        let second = bus.broker();

        let mut rx_first = first.subscribe("channel:c1").await.unwrap();
        let mut rx_second = second.subscribe("channel:c1").await.unwrap();

        first.publish("channel:c1", "hello").await.unwrap();

        assert_eq!(rx_first.recv().await.unwrap(), "hello");
        assert_eq!(rx_second.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn unsubscribe_closes_only_that_delivery_stream() {
        let bus = MemoryBus::new();
        let first = bus.broker();
        let second = bus.broker();

        let mut rx_first = first.subscribe("channel:c1").await.unwrap();
        let mut rx_second = second.subscribe("channel:c1").await.unwrap();

        first.unsubscribe("channel:c1").await.unwrap();
        assert_eq!(rx_first.recv().await, None);

        second.publish("channel:c1", "still on").await.unwrap();
        assert_eq!(rx_second.recv().await.unwrap(), "still on");
        assert!(bus.is_subscribed("channel:c1").await);
    }

    #[tokio::test]
    async fn double_subscribe_is_rejected() {
        let bus = MemoryBus::new();
        let broker = bus.broker();

        let _rx = broker.subscribe("channel:c1").await.unwrap();
        let err = broker.subscribe("channel:c1").await.unwrap_err();

        assert!(matches!(err, BrokerError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_a_no_op() {
        let bus = MemoryBus::new();
        let broker = bus.broker();

        broker.unsubscribe("channel:none").await.unwrap();
        assert!(!bus.is_subscribed("channel:none").await);
    }
}
