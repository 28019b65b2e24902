//! Brings the schema up on startup.
//!
//! The whole schema is two tables, so the DDL is embedded rather than loaded
//! from script files. Every statement is `IF NOT EXISTS`, making bootstrap
//! safe to run on every start and from several processes at once.

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

const DDL: &[(&str, &str)] = &[
    (
        "chat_messages",
        "CREATE TABLE IF NOT EXISTS chat_messages (
            message_id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            chat_sequence_id BIGINT NOT NULL,
            message_sequence_id BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            text TEXT,
            is_deleted BOOLEAN,
            UNIQUE (chat_id, chat_sequence_id)
        )",
    ),
    (
        "presence_entries",
        "CREATE TABLE IF NOT EXISTS presence_entries (
            channel_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            data JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (channel_id, client_id)
        )",
    ),
    (
        "presence_entries_updated_idx",
        "CREATE INDEX IF NOT EXISTS presence_entries_updated_idx
            ON presence_entries (updated_at)",
    ),
];

/// Bootstrap failures, tagged with the object whose DDL failed.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A DDL statement was rejected by the database.
    #[error("database error creating {object}: {source}")]
    Sql {
        /// Table or index the failing statement creates.
        object: &'static str,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },
}

/// Applies the schema DDL inside one transaction.
///
/// # Errors
/// Returns [`BootstrapError::Sql`] naming the object whose statement failed;
/// nothing is committed in that case.
pub async fn run(pool: &PgPool) -> Result<(), BootstrapError> {
    info!(objects = DDL.len(), "running database bootstrap");

    let mut transaction = pool.begin().await.map_err(|source| BootstrapError::Sql {
        object: "transaction",
        source,
    })?;

    for &(object, statement) in DDL {
        debug!(object, "applying schema statement");
        sqlx::query(statement)
            .execute(&mut *transaction)
            .await
            .map_err(|source| BootstrapError::Sql { object, source })?;
    }

    transaction
        .commit()
        .await
        .map_err(|source| BootstrapError::Sql {
            object: "transaction",
            source,
        })
}

#[cfg(test)]
static LIVENESS_OVERRIDE: std::sync::Mutex<Option<Result<(), String>>> =
    std::sync::Mutex::new(None);

/// Forces the next liveness probes to the given outcome, bypassing the
/// database. Pass `None` to restore real probing.
#[cfg(test)]
pub fn set_liveness_override(value: Option<Result<(), String>>) {
    *LIVENESS_OVERRIDE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = value;
}

/// Cheap connectivity probe used by readiness checks.
///
/// # Errors
/// Returns the driver error when the database is unreachable.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    #[cfg(test)]
    if let Some(forced) = LIVENESS_OVERRIDE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
    {
        return forced.map_err(sqlx::Error::Protocol);
    }

    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_is_rerunnable() {
        for (object, statement) in DDL {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement for {object} must be idempotent"
            );
        }
    }

    #[test]
    fn schema_covers_both_tables() {
        let objects: Vec<&str> = DDL.iter().map(|(object, _)| *object).collect();
        assert!(objects.contains(&"chat_messages"));
        assert!(objects.contains(&"presence_entries"));
    }
}
