//! Sequenced chat log: transactional message writes with per-chat dense
//! ordering, and the broadcast that follows a committed write.
//!
//! Sequence assignment happens inside a single INSERT .. ON CONFLICT
//! statement, so a failed transaction can never leak a gap into
//! `chat_sequence_id`. Concurrent first-writes to the same chat may collide
//! on the `(chat_id, chat_sequence_id)` unique constraint; those writes are
//! retried a bounded number of times.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use shared::models::{Channel, Message, MessageUpsert, Timestamp, UpdateEnvelope, UpsertReceipt};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::relay::ChannelRelay;

/// Load limits beyond this bound are rejected by validation, not clamped.
const MAX_LOAD_LIMIT: i64 = 100;

/// How often a sequence-contention collision is retried before giving up.
const MAX_SEQUENCE_ATTEMPTS: u32 = 3;

/// Failures surfaced by chat log operations.
#[derive(Debug, Error)]
pub enum ChatLogError {
    /// The backing store rejected the operation.
    #[error("chat log database operation failed")]
    Database(#[from] sqlx::Error),
    /// The request was malformed; nothing was written.
    #[error("invalid chat log request: {0}")]
    Validation(String),
    /// Concurrent writers kept colliding on sequence assignment.
    #[error("chat sequence contention persisted after {0} attempts")]
    Contention(u32),
}

/// Storage seam for the sequenced log. `upsert` must be atomic: sequence
/// assignment and row write happen together or not at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatLogStore: Send + Sync {
    /// Inserts or edits one message, returning its authoritative sequencing.
    async fn upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ChatLogError>;

    /// Latest surviving rows for a chat: one row per message id, tombstones
    /// excluded, ordered by `chat_sequence_id` descending, at most `limit`.
    async fn load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ChatLogError>;
}

const UPSERT_SQL: &str = "\
    INSERT INTO chat_messages \
        (message_id, chat_id, chat_sequence_id, message_sequence_id, text, is_deleted) \
    VALUES \
        ($1, $2, \
         (SELECT COALESCE(MAX(chat_sequence_id) + 1, 0) FROM chat_messages WHERE chat_id = $2), \
         0, $3, $4) \
    ON CONFLICT (message_id) DO UPDATE SET \
        message_sequence_id = chat_messages.message_sequence_id + 1, \
        text = EXCLUDED.text, \
        is_deleted = EXCLUDED.is_deleted \
    RETURNING chat_sequence_id, message_sequence_id, created_at";

const LOAD_SQL: &str = "\
    SELECT message_id, chat_sequence_id, message_sequence_id, created_at, text, is_deleted \
    FROM chat_messages \
    WHERE chat_id = $1 AND is_deleted IS NOT TRUE \
    ORDER BY chat_sequence_id DESC \
    LIMIT $2";

/// PostgreSQL-backed log. `created_at` comes from the row default and is
/// never touched on edit, so it always reflects first-write time.
#[derive(Clone)]
pub struct PgChatLog {
    pool: PgPool,
}

impl PgChatLog {
    /// A log over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, sqlx::Error> {
        #[derive(sqlx::FromRow)]
        struct ReceiptRow {
            chat_sequence_id: i64,
            message_sequence_id: i64,
            created_at: DateTime<Utc>,
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ReceiptRow>(UPSERT_SQL)
            .bind(&upsert.message_id)
            .bind(chat_id)
            .bind(upsert.text.as_deref())
            .bind(upsert.is_deleted)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(UpsertReceipt {
            chat_sequence_id: row.chat_sequence_id,
            message_sequence_id: row.message_sequence_id,
            created_at: Timestamp(row.created_at),
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl ChatLogStore for PgChatLog {
    async fn upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ChatLogError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_upsert(chat_id, upsert).await {
                Ok(receipt) => return Ok(receipt),
                Err(err) if is_unique_violation(&err) => {
                    if attempt >= MAX_SEQUENCE_ATTEMPTS {
                        warn!(chat_id, attempt, "giving up on sequence contention");
                        return Err(ChatLogError::Contention(attempt));
                    }
                    debug!(chat_id, attempt, "sequence contention, retrying");
                }
                Err(err) => return Err(ChatLogError::Database(err)),
            }
        }
    }

    async fn load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ChatLogError> {
        #[derive(sqlx::FromRow)]
        struct MessageRow {
            message_id: String,
            chat_sequence_id: i64,
            message_sequence_id: i64,
            created_at: DateTime<Utc>,
            text: Option<String>,
            is_deleted: Option<bool>,
        }

        let rows = sqlx::query_as::<_, MessageRow>(LOAD_SQL)
            .bind(chat_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| Message {
                message_id: row.message_id,
                chat_id: chat_id.to_string(),
                chat_sequence_id: row.chat_sequence_id,
                message_sequence_id: row.message_sequence_id,
                created_at: Timestamp(row.created_at),
                text: row.text,
                is_deleted: row.is_deleted,
                is_optimistic: None,
            })
            .collect())
    }
}

#[derive(Default)]
struct ChatState {
    rows: HashMap<String, StoredRow>,
    next_sequence: i64,
}

#[derive(Clone)]
struct StoredRow {
    chat_sequence_id: i64,
    message_sequence_id: i64,
    created_at: Timestamp,
    text: Option<String>,
    is_deleted: Option<bool>,
}

/// In-memory log used when no database is configured and in tests. Same
/// sequencing semantics as [`PgChatLog`], minus durability.
#[derive(Debug, Default)]
pub struct MemoryChatLog {
    chats: Mutex<HashMap<String, ChatState>>,
}

impl std::fmt::Debug for ChatState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatState")
            .field("rows", &self.rows.len())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

#[async_trait]
impl ChatLogStore for MemoryChatLog {
    async fn upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ChatLogError> {
        let mut chats = self.chats.lock().await;
        let state = chats.entry(chat_id.to_string()).or_default();

        let row = if let Some(row) = state.rows.get_mut(&upsert.message_id) {
            row.message_sequence_id += 1;
            row.text = upsert.text.clone();
            row.is_deleted = upsert.is_deleted;
            row.clone()
        } else {
            let row = StoredRow {
                chat_sequence_id: state.next_sequence,
                message_sequence_id: 0,
                created_at: Timestamp::now(),
                text: upsert.text.clone(),
                is_deleted: upsert.is_deleted,
            };
            state.next_sequence += 1;
            state.rows.insert(upsert.message_id.clone(), row.clone());
            row
        };

        Ok(UpsertReceipt {
            chat_sequence_id: row.chat_sequence_id,
            message_sequence_id: row.message_sequence_id,
            created_at: row.created_at,
        })
    }

    async fn load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ChatLogError> {
        let chats = self.chats.lock().await;
        let Some(state) = chats.get(chat_id) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<Message> = state
            .rows
            .iter()
            .filter(|(_, row)| row.is_deleted != Some(true))
            .map(|(message_id, row)| Message {
                message_id: message_id.clone(),
                chat_id: chat_id.to_string(),
                chat_sequence_id: row.chat_sequence_id,
                message_sequence_id: row.message_sequence_id,
                created_at: row.created_at,
                text: row.text.clone(),
                is_deleted: row.is_deleted,
                is_optimistic: None,
            })
            .collect();
        rows.sort_by(|a, b| b.chat_sequence_id.cmp(&a.chat_sequence_id));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }
}

/// Write path plus broadcast: validates, persists through the store, then
/// publishes the authoritative row on the chat's content channel tagged with
/// the writer's clientId.
///
/// A failed write publishes nothing. A committed write whose broadcast fails
/// still succeeds; subscribers catch up from the store on their next load.
#[derive(Clone)]
pub struct ChatLogService {
    store: Arc<dyn ChatLogStore>,
    relay: ChannelRelay,
}

impl ChatLogService {
    /// A service writing through `store` and broadcasting via `relay`.
    #[must_use]
    pub fn new(store: Arc<dyn ChatLogStore>, relay: ChannelRelay) -> Self {
        Self { store, relay }
    }

    /// Inserts or edits one message and broadcasts the committed row.
    ///
    /// # Errors
    /// [`ChatLogError::Validation`] for blank ids or an upsert carrying no
    /// fields; store errors pass through unchanged.
    #[instrument(
        name = "chat.upsert",
        skip(self, upsert),
        fields(chat_id = %chat_id, message_id = %upsert.message_id),
        err
    )]
    pub async fn upsert(
        &self,
        chat_id: &str,
        upsert: &MessageUpsert,
    ) -> Result<UpsertReceipt, ChatLogError> {
        if chat_id.trim().is_empty() {
            return Err(ChatLogError::Validation("chat id must not be blank".into()));
        }
        if upsert.message_id.trim().is_empty() {
            return Err(ChatLogError::Validation(
                "message id must not be blank".into(),
            ));
        }
        if upsert.is_empty() {
            return Err(ChatLogError::Validation(
                "upsert carries neither text nor a tombstone flag".into(),
            ));
        }

        let receipt = self.store.upsert(chat_id, upsert).await?;
        counter!("chat_upserts_total").increment(1);

        let row = Message::authoritative(chat_id, upsert, &receipt);
        match UpdateEnvelope::encode(upsert.client_id.clone(), &[row]) {
            Ok(envelope) => {
                let channel = Channel::content(chat_id).name();
                if let Err(err) = self.relay.publish(&channel, &envelope).await {
                    counter!("chat_broadcast_failures_total").increment(1);
                    warn!(chat_id, error = %err, "committed write could not be broadcast");
                }
            }
            Err(err) => {
                counter!("chat_broadcast_failures_total").increment(1);
                warn!(chat_id, error = %err, "committed row could not be encoded");
            }
        }

        Ok(receipt)
    }

    /// Latest surviving rows for a chat, newest first.
    ///
    /// # Errors
    /// [`ChatLogError::Validation`] for a blank chat id or an out-of-range
    /// limit; store errors pass through unchanged.
    #[instrument(name = "chat.load", skip(self), err)]
    pub async fn load(&self, chat_id: &str, limit: i64) -> Result<Vec<Message>, ChatLogError> {
        if chat_id.trim().is_empty() {
            return Err(ChatLogError::Validation("chat id must not be blank".into()));
        }
        if !(1..=MAX_LOAD_LIMIT).contains(&limit) {
            return Err(ChatLogError::Validation(format!(
                "limit must be between 1 and {MAX_LOAD_LIMIT}"
            )));
        }
        self.store.load(chat_id, limit).await
    }
}
