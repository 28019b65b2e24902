//! The pub/sub broker seam.
//!
//! The relay talks to the broker through the [`Broker`] trait: one
//! subscription per channel, deliveries handed over as an in-process channel
//! of raw payloads. [`RedisBroker`] backs it with Redis pub/sub for
//! cross-process fan-out; [`MemoryBus`] provides an in-process substitute for
//! tests and broker-less dev runs.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryBroker, MemoryBus};
pub use redis::RedisBroker;

/// Failures surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not establish the broker connection.
    #[error("broker connection failed")]
    Connect(#[source] ::redis::RedisError),
    /// A publish/subscribe/unsubscribe command failed.
    #[error("broker command failed")]
    Command(#[source] ::redis::RedisError),
    /// A second subscription was requested for a channel that already has
    /// one. The relay reference-counts locally, so this indicates a caller
    /// bug rather than a broker condition.
    #[error("already subscribed to channel {0}")]
    AlreadySubscribed(String),
}

/// Pub/sub transport used by the channel relay.
///
/// Implementations hold at most one live subscription per channel name;
/// deliveries for a channel arrive in publish order on the receiver returned
/// by [`Broker::subscribe`]. Dropping the broker closes every delivery
/// channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Opens the subscription for `channel` and returns its delivery stream.
    /// The stream ends when [`Broker::unsubscribe`] is called or the broker
    /// connection is lost.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, BrokerError>;

    /// Closes the subscription for `channel`. Unsubscribing a channel with no
    /// subscription is a no-op.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;
}
