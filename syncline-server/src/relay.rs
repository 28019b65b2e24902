//! The channel relay: per-channel registry of local SSE subscribers fed by
//! exactly one broker subscription per channel.
//!
//! The broker subscription is reference-counted by the local registration
//! set: it opens with the first subscriber and closes with the last. Fan-out
//! snapshots the recipient list before dispatch, so delivery never iterates a
//! set being mutated, and per-recipient failures stay isolated. Payloads that
//! parse as [`UpdateEnvelope`]s carrying an originating clientId are not
//! echoed back to streams registered under that clientId.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::{counter, gauge};
use shared::models::UpdateEnvelope;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};

/// Failures surfaced by relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The underlying broker call failed; local state was rolled back.
    #[error("broker operation failed")]
    Broker(#[from] BrokerError),
    /// The envelope could not be rendered into a broker payload.
    #[error("failed to encode envelope")]
    Encode(#[from] serde_json::Error),
    /// The relay was shut down; no further subscriptions or publishes.
    #[error("relay is shut down")]
    ShutDown,
}

struct Registration {
    client_id: Option<String>,
    sender: mpsc::Sender<String>,
}

struct ChannelState {
    registrations: HashMap<Uuid, Registration>,
    pump: JoinHandle<()>,
}

/// Owned registry of channel subscriptions, cheap to clone and injected into
/// request handlers. Dropping all clones does not tear down subscriptions;
/// call [`ChannelRelay::shutdown`] for that.
#[derive(Clone)]
pub struct ChannelRelay {
    broker: Arc<dyn Broker>,
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    capacity: usize,
    closed: Arc<AtomicBool>,
}

impl ChannelRelay {
    /// A relay over `broker`. `capacity` bounds each subscriber's buffered
    /// payloads; a subscriber that falls that far behind is disconnected.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, capacity: usize) -> Self {
        Self {
            broker,
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a new stream under `channel` and returns its delivery
    /// receiver plus a guard that releases the registration when dropped.
    ///
    /// The first registration for a channel opens the broker subscription; if
    /// that fails nothing is registered, keeping "broker-subscribed iff local
    /// set non-empty" intact.
    ///
    /// # Errors
    /// [`RelayError::Broker`] when the broker subscribe fails,
    /// [`RelayError::ShutDown`] after [`ChannelRelay::shutdown`].
    pub async fn subscribe(
        &self,
        channel: &str,
        client_id: Option<String>,
    ) -> Result<(SubscriberGuard, mpsc::Receiver<String>), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ShutDown);
        }

        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.capacity);
        let registration = Registration { client_id, sender };

        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get_mut(channel) {
            state.registrations.insert(id, registration);
        } else {
            let deliveries = self.broker.subscribe(channel).await?;
            let pump = self.spawn_pump(channel.to_string(), deliveries);
            let mut registrations = HashMap::new();
            registrations.insert(id, registration);
            channels.insert(
                channel.to_string(),
                ChannelState {
                    registrations,
                    pump,
                },
            );
            gauge!("relay_channel_subscriptions").increment(1);
        }
        drop(channels);

        gauge!("relay_open_streams").increment(1);
        debug!(%channel, stream = %id, "stream registered");
        Ok((
            SubscriberGuard {
                relay: self.clone(),
                channel: channel.to_string(),
                id,
            },
            receiver,
        ))
    }

    /// Removes one registration. Closing the last registration for a channel
    /// closes the broker subscription. Unknown registrations are a no-op.
    ///
    /// # Errors
    /// [`RelayError::Broker`] when the final broker unsubscribe fails; the
    /// local registration is gone either way.
    pub async fn unsubscribe(&self, channel: &str, id: Uuid) -> Result<(), RelayError> {
        let mut channels = self.channels.lock().await;
        let Some(state) = channels.get_mut(channel) else {
            return Ok(());
        };
        if state.registrations.remove(&id).is_none() {
            return Ok(());
        }
        gauge!("relay_open_streams").decrement(1);
        debug!(%channel, stream = %id, "stream released");

        if state.registrations.is_empty() {
            // Last one out: drop the channel entry and the broker
            // subscription while still holding the lock, so a concurrent
            // first-subscriber cannot observe the half-closed channel. The
            // pump exits on its own once the delivery stream closes.
            channels.remove(channel);
            gauge!("relay_channel_subscriptions").decrement(1);
            self.broker.unsubscribe(channel).await?;
        }
        Ok(())
    }

    /// Publishes an envelope on `channel` through the broker. Local delivery
    /// happens via the broker round-trip, same as for remote processes.
    ///
    /// # Errors
    /// [`RelayError::Encode`] if the envelope cannot be serialized,
    /// [`RelayError::Broker`] if the broker publish fails,
    /// [`RelayError::ShutDown`] after shutdown.
    pub async fn publish(&self, channel: &str, envelope: &UpdateEnvelope) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ShutDown);
        }
        let payload = envelope.to_payload()?;
        self.broker.publish(channel, &payload).await?;
        counter!("relay_publish_total").increment(1);
        Ok(())
    }

    /// Local subscriber counts per channel.
    pub async fn stats(&self) -> BTreeMap<String, usize> {
        self.channels
            .lock()
            .await
            .iter()
            .map(|(name, state)| (name.clone(), state.registrations.len()))
            .collect()
    }

    /// Closes every broker subscription and stops delivery. Subsequent
    /// subscribes and publishes fail with [`RelayError::ShutDown`].
    #[allow(clippy::cast_precision_loss)]
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<(String, ChannelState)> = {
            let mut channels = self.channels.lock().await;
            channels.drain().collect()
        };
        for (channel, state) in drained {
            if let Err(err) = self.broker.unsubscribe(&channel).await {
                warn!(%channel, error = %err, "broker unsubscribe failed during shutdown");
            }
            state.pump.abort();
            gauge!("relay_channel_subscriptions").decrement(1);
            gauge!("relay_open_streams").decrement(state.registrations.len() as f64);
        }
    }

    fn spawn_pump(
        &self,
        channel: String,
        mut deliveries: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = deliveries.recv().await {
                relay.dispatch(&channel, &payload).await;
            }
            debug!(%channel, "delivery pump finished");
        })
    }

    async fn dispatch(&self, channel: &str, payload: &str) {
        // Payloads that do not parse as envelopes are forwarded untouched;
        // suppression only applies when an origin is identifiable.
        let envelope = UpdateEnvelope::from_payload(payload).ok();

        // Snapshot recipients before dispatch; the set may be mutated by
        // subscribe/unsubscribe while we write.
        let recipients: Vec<(Uuid, Option<String>, mpsc::Sender<String>)> = {
            let channels = self.channels.lock().await;
            let Some(state) = channels.get(channel) else {
                return;
            };
            state
                .registrations
                .iter()
                .map(|(id, registration)| {
                    (
                        *id,
                        registration.client_id.clone(),
                        registration.sender.clone(),
                    )
                })
                .collect()
        };

        let mut evicted = Vec::new();
        for (id, client_id, sender) in recipients {
            if let Some(envelope) = &envelope
                && envelope.suppresses(client_id.as_deref())
            {
                counter!("relay_suppressed_total").increment(1);
                continue;
            }
            match sender.try_send(payload.to_string()) {
                Ok(()) => {
                    counter!("relay_delivery_total").increment(1);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%channel, stream = %id, "subscriber too far behind, disconnecting");
                    counter!("relay_evicted_total").increment(1);
                    evicted.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(id);
                }
            }
        }

        for id in evicted {
            if let Err(err) = self.unsubscribe(channel, id).await {
                warn!(%channel, stream = %id, error = %err, "failed to drop dead stream");
            }
        }
    }
}

/// Releases a relay registration when dropped, covering every terminal
/// transport event (client close, network error, server shutdown) through
/// the one drop path.
pub struct SubscriberGuard {
    relay: ChannelRelay,
    channel: String,
    id: Uuid,
}

impl SubscriberGuard {
    /// The registration id, stable for the lifetime of the stream.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl std::fmt::Debug for SubscriberGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberGuard")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let relay = self.relay.clone();
        let channel = std::mem::take(&mut self.channel);
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = relay.unsubscribe(&channel, id).await {
                    warn!(%channel, stream = %id, error = %err, "failed to release stream");
                }
            });
        }
    }
}
