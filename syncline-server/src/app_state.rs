//! State shared with routes via axum `State`.

/// Application state available to all routes. Service handles (relay,
/// presence, chat log) travel as request extensions; only the optional
/// database pool lives here, for readiness probes.
#[derive(Clone, Default)]
pub struct AppState {
    pub(crate) pool: Option<sqlx::PgPool>,
}

impl AppState {
    /// State backed by a live database pool.
    #[must_use]
    pub fn with_pool(pool: sqlx::PgPool) -> Self {
        Self { pool: Some(pool) }
    }
}
