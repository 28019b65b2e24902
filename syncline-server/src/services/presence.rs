//! Presence register: who is currently in a channel, kept alive by
//! heartbeats and reaped by a timed TTL sweep.
//!
//! Liveness is heartbeat-driven only. Stream closure does not delete the
//! entry; a vanished client disappears within `ttl + sweep_interval` of its
//! last refresh, and the sweep publishes the delete diffs. This keeps the
//! delete path single-sourced, so no diff is ever emitted twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use shared::models::{Channel, PresenceEntry, PresenceUpdate, UpdateEnvelope};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::relay::ChannelRelay;

/// Failures surfaced by presence operations.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The backing store rejected the operation.
    #[error("presence database operation failed")]
    Database(#[from] sqlx::Error),
    /// The request was malformed; nothing was written.
    #[error("invalid presence request: {0}")]
    Validation(String),
}

/// An entry removed by the TTL sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredEntry {
    /// Channel the entry belonged to.
    pub channel_id: String,
    /// Client that stopped refreshing.
    pub client_id: String,
}

/// Storage seam for the register. Expiry is the store's job so that a single
/// sweep pass removes entries and reports them exactly once, even with
/// several server processes sweeping the same table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// All entries currently recorded for a channel.
    async fn get(&self, channel_id: &str) -> Result<Vec<PresenceEntry>, PresenceError>;

    /// Writes or overwrites one entry and refreshes its liveness timestamp.
    async fn upsert(
        &self,
        channel_id: &str,
        client_id: &str,
        data: &Value,
    ) -> Result<(), PresenceError>;

    /// Refreshes the liveness timestamp only. `false` when the entry does
    /// not exist (expired or never created); nothing is written in that case.
    async fn heartbeat(&self, channel_id: &str, client_id: &str) -> Result<bool, PresenceError>;

    /// Deletes every entry older than `ttl` and returns what was removed.
    async fn expire(&self, ttl: Duration) -> Result<Vec<ExpiredEntry>, PresenceError>;
}

const GET_SQL: &str = "\
    SELECT client_id, data FROM presence_entries \
    WHERE channel_id = $1 \
    ORDER BY client_id";

const UPSERT_SQL: &str = "\
    INSERT INTO presence_entries (channel_id, client_id, data) \
    VALUES ($1, $2, $3) \
    ON CONFLICT (channel_id, client_id) DO UPDATE SET \
        data = EXCLUDED.data, \
        updated_at = CURRENT_TIMESTAMP";

const HEARTBEAT_SQL: &str = "\
    UPDATE presence_entries SET updated_at = CURRENT_TIMESTAMP \
    WHERE channel_id = $1 AND client_id = $2";

const EXPIRE_SQL: &str = "\
    DELETE FROM presence_entries \
    WHERE updated_at < CURRENT_TIMESTAMP - make_interval(secs => $1) \
    RETURNING channel_id, client_id";

/// PostgreSQL-backed register.
#[derive(Clone)]
pub struct PgPresenceStore {
    pool: PgPool,
}

impl PgPresenceStore {
    /// A register over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn get(&self, channel_id: &str) -> Result<Vec<PresenceEntry>, PresenceError> {
        #[derive(sqlx::FromRow)]
        struct EntryRow {
            client_id: String,
            data: Value,
        }

        let rows = sqlx::query_as::<_, EntryRow>(GET_SQL)
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| PresenceEntry {
                client_id: row.client_id,
                data: row.data,
            })
            .collect())
    }

    async fn upsert(
        &self,
        channel_id: &str,
        client_id: &str,
        data: &Value,
    ) -> Result<(), PresenceError> {
        sqlx::query(UPSERT_SQL)
            .bind(channel_id)
            .bind(client_id)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, channel_id: &str, client_id: &str) -> Result<bool, PresenceError> {
        let result = sqlx::query(HEARTBEAT_SQL)
            .bind(channel_id)
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire(&self, ttl: Duration) -> Result<Vec<ExpiredEntry>, PresenceError> {
        #[derive(sqlx::FromRow)]
        struct ExpiredRow {
            channel_id: String,
            client_id: String,
        }

        let rows = sqlx::query_as::<_, ExpiredRow>(EXPIRE_SQL)
            .bind(ttl.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ExpiredEntry {
                channel_id: row.channel_id,
                client_id: row.client_id,
            })
            .collect())
    }
}

struct MemoryEntry {
    data: Value,
    refreshed_at: Instant,
}

/// In-memory register used when no database is configured and in tests.
/// Liveness uses the tokio clock, so expiry is testable under paused time.
#[derive(Default)]
pub struct MemoryPresenceStore {
    entries: Mutex<HashMap<(String, String), MemoryEntry>>,
}

impl std::fmt::Debug for MemoryPresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPresenceStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn get(&self, channel_id: &str) -> Result<Vec<PresenceEntry>, PresenceError> {
        let entries = self.entries.lock().await;
        let mut found: Vec<PresenceEntry> = entries
            .iter()
            .filter(|((channel, _), _)| channel == channel_id)
            .map(|((_, client_id), entry)| PresenceEntry {
                client_id: client_id.clone(),
                data: entry.data.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(found)
    }

    async fn upsert(
        &self,
        channel_id: &str,
        client_id: &str,
        data: &Value,
    ) -> Result<(), PresenceError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            (channel_id.to_string(), client_id.to_string()),
            MemoryEntry {
                data: data.clone(),
                refreshed_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, channel_id: &str, client_id: &str) -> Result<bool, PresenceError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&(channel_id.to_string(), client_id.to_string())) {
            Some(entry) => {
                entry.refreshed_at = Instant::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire(&self, ttl: Duration) -> Result<Vec<ExpiredEntry>, PresenceError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.refreshed_at) > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for key in expired {
            entries.remove(&key);
            removed.push(ExpiredEntry {
                channel_id: key.0,
                client_id: key.1,
            });
        }
        Ok(removed)
    }
}

/// Presence operations plus their broadcasts.
///
/// Upserts publish an upsert diff tagged with the originating clientId, so
/// the writer does not see its own join echoed back. Sweep deletions are
/// server-originated (clientId null) and reach every subscriber, grouped
/// into one envelope per channel.
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    relay: ChannelRelay,
    ttl: Duration,
}

impl PresenceService {
    /// A service writing through `store` and broadcasting via `relay`.
    /// Entries older than `ttl` are removed by [`PresenceService::sweep_expired`].
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, relay: ChannelRelay, ttl: Duration) -> Self {
        Self { store, relay, ttl }
    }

    /// Current channel membership as a list of upsert diffs, the same shape
    /// the live stream carries, so clients feed both into one apply path.
    ///
    /// # Errors
    /// [`PresenceError::Validation`] for a blank channel id; store errors
    /// pass through unchanged.
    #[instrument(name = "presence.snapshot", skip(self), err)]
    pub async fn snapshot(&self, channel_id: &str) -> Result<Vec<PresenceUpdate>, PresenceError> {
        require_id("channel id", channel_id)?;
        let entries = self.store.get(channel_id).await?;
        Ok(entries
            .into_iter()
            .map(|entry| PresenceUpdate::Upsert {
                channel_id: channel_id.to_string(),
                client_id: entry.client_id,
                data: entry.data,
            })
            .collect())
    }

    /// Writes an entry, refreshes its liveness, and broadcasts the upsert.
    ///
    /// # Errors
    /// [`PresenceError::Validation`] for blank ids; store errors pass
    /// through unchanged.
    #[instrument(
        name = "presence.upsert",
        skip(self, data),
        fields(channel_id = %channel_id, client_id = %client_id),
        err
    )]
    pub async fn upsert(
        &self,
        channel_id: &str,
        client_id: &str,
        data: Value,
    ) -> Result<(), PresenceError> {
        require_id("channel id", channel_id)?;
        require_id("client id", client_id)?;

        self.store.upsert(channel_id, client_id, &data).await?;
        counter!("presence_upserts_total").increment(1);

        let diff = PresenceUpdate::Upsert {
            channel_id: channel_id.to_string(),
            client_id: client_id.to_string(),
            data,
        };
        self.broadcast(channel_id, Some(client_id.to_string()), &[diff])
            .await;
        Ok(())
    }

    /// Refreshes liveness without touching data. `false` tells the caller
    /// its entry is gone and a full upsert is needed.
    ///
    /// # Errors
    /// [`PresenceError::Validation`] for blank ids; store errors pass
    /// through unchanged.
    #[instrument(name = "presence.heartbeat", skip(self), err)]
    pub async fn heartbeat(
        &self,
        channel_id: &str,
        client_id: &str,
    ) -> Result<bool, PresenceError> {
        require_id("channel id", channel_id)?;
        require_id("client id", client_id)?;

        let refreshed = self.store.heartbeat(channel_id, client_id).await?;
        if !refreshed {
            debug!(channel_id, client_id, "heartbeat for absent entry");
        }
        Ok(refreshed)
    }

    /// One sweep pass: removes entries past the TTL and broadcasts their
    /// delete diffs, one envelope per affected channel. Returns how many
    /// entries were removed.
    ///
    /// # Errors
    /// Store errors pass through unchanged; nothing is broadcast then.
    #[instrument(name = "presence.sweep", skip(self), err)]
    pub async fn sweep_expired(&self) -> Result<usize, PresenceError> {
        let expired = self.store.expire(self.ttl).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let count = expired.len();
        counter!("presence_expired_total").increment(count as u64);

        let mut per_channel: BTreeMap<String, Vec<PresenceUpdate>> = BTreeMap::new();
        for entry in expired {
            per_channel
                .entry(entry.channel_id.clone())
                .or_default()
                .push(PresenceUpdate::Delete {
                    channel_id: entry.channel_id,
                    client_id: entry.client_id,
                });
        }
        for (channel_id, diffs) in per_channel {
            debug!(channel_id, removed = diffs.len(), "presence entries expired");
            self.broadcast(&channel_id, None, &diffs).await;
        }
        Ok(count)
    }

    /// The TTL this register expires entries against.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn broadcast(&self, channel_id: &str, origin: Option<String>, diffs: &[PresenceUpdate]) {
        match UpdateEnvelope::encode(origin, diffs) {
            Ok(envelope) => {
                let channel = Channel::presence(channel_id).name();
                if let Err(err) = self.relay.publish(&channel, &envelope).await {
                    counter!("presence_broadcast_failures_total").increment(1);
                    warn!(channel_id, error = %err, "presence diff could not be broadcast");
                }
            }
            Err(err) => {
                counter!("presence_broadcast_failures_total").increment(1);
                warn!(channel_id, error = %err, "presence diff could not be encoded");
            }
        }
    }
}

fn require_id(field: &str, value: &str) -> Result<(), PresenceError> {
    if value.trim().is_empty() {
        return Err(PresenceError::Validation(format!(
            "{field} must not be blank"
        )));
    }
    Ok(())
}

/// Runs the TTL sweep on a fixed cadence until `shutdown` fires. An entry
/// that stops refreshing disappears at most `ttl + interval` after its last
/// refresh.
pub fn spawn_presence_sweeper(
    service: PresenceService,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the first sweep
        // happens one full interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("presence sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = service.sweep_expired().await {
                        warn!(error = %err, "presence sweep failed");
                    }
                }
            }
        }
    })
}
