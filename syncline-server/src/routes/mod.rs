//! Route registration.

pub mod health;
pub mod openapi;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{app_state::AppState, handlers};

/// The API surface mounted under `/api`.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/channels/{channel}/subscribe",
            get(handlers::channels::subscribe_channel),
        )
        .route(
            "/channels/{channel}/publish",
            post(handlers::channels::publish_channel),
        )
        .route("/stats", get(handlers::channels::channel_stats))
        .route(
            "/presence/{channel_id}",
            get(handlers::presence::presence_snapshot).post(handlers::presence::presence_upsert),
        )
        .route(
            "/presence/{channel_id}/heartbeat",
            post(handlers::presence::presence_heartbeat),
        )
        .route(
            "/chats/{chat_id}/messages",
            get(handlers::chat::load_messages).post(handlers::chat::upsert_message),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_router_is_not_empty() {
        let router = create_api_router();

        assert!(router.has_routes(), "router should not be empty");
    }
}
