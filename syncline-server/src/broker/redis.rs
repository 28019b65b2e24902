//! Redis-backed broker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSubSink};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Broker, BrokerError};

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

/// Broker backed by Redis pub/sub.
///
/// Publishes go through a [`ConnectionManager`], which reconnects with
/// backoff on its own. Subscriptions share one pub/sub connection: a driver
/// task reads its message stream and routes payloads to the per-channel
/// delivery senders. If the pub/sub connection is lost the delivery channels
/// close and subscribers are expected to re-subscribe.
pub struct RedisBroker {
    publisher: ConnectionManager,
    sink: Mutex<PubSubSink>,
    routes: Routes,
    driver: JoinHandle<()>,
}

impl RedisBroker {
    /// Connects both the publish and the pub/sub sides.
    ///
    /// # Errors
    /// Returns [`BrokerError::Connect`] if either connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(BrokerError::Connect)?;
        let publisher = client
            .get_connection_manager()
            .await
            .map_err(BrokerError::Connect)?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(BrokerError::Connect)?;
        let (sink, mut stream) = pubsub.split();

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let driver_routes = Arc::clone(&routes);
        let driver = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%channel, error = %err, "dropping undecodable broker payload");
                        continue;
                    }
                };
                let sender = driver_routes.lock().await.get(&channel).cloned();
                if let Some(sender) = sender
                    && sender.send(payload).is_err()
                {
                    // Receiver side went away without unsubscribing.
                    driver_routes.lock().await.remove(&channel);
                }
            }
            debug!("redis pub/sub stream ended");
        });

        Ok(Self {
            publisher,
            sink: Mutex::new(sink),
            routes,
            driver,
        })
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(BrokerError::Command)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<String>, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock().await;
            if routes.contains_key(channel) {
                return Err(BrokerError::AlreadySubscribed(channel.to_string()));
            }
            routes.insert(channel.to_string(), tx);
        }

        // The route must exist before the SUBSCRIBE command completes, or an
        // immediate delivery could slip past; on command failure it is rolled
        // back so no half-open subscription remains.
        if let Err(err) = self.sink.lock().await.subscribe(channel).await {
            self.routes.lock().await.remove(channel);
            return Err(BrokerError::Command(err));
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        if self.routes.lock().await.remove(channel).is_none() {
            return Ok(());
        }
        self.sink
            .lock()
            .await
            .unsubscribe(channel)
            .await
            .map_err(BrokerError::Command)
    }
}
