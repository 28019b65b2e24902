//! Server assembly: tracing, metrics, stores, broker, relay, router, and the
//! run loop with graceful shutdown.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, StatusCode, header};
use axum::{Extension, Router, middleware, response::IntoResponse, routing::get, serve};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use shared::config::{Config, DatabaseConfig, LogFormat};

use crate::{
    app_state::AppState,
    broker::{Broker, MemoryBus, RedisBroker},
    db::bootstrap,
    middleware::request_context,
    relay::ChannelRelay,
    routes::{self, openapi::openapi_routes},
    services::{
        ChatLogService, ChatLogStore, MemoryChatLog, MemoryPresenceStore, PgChatLog,
        PgPresenceStore, PresenceService, PresenceStore, spawn_presence_sweeper,
    },
    tracer,
};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber from the logging configuration and
/// returns the effective default level.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).init();
    } else {
        fmt_builder.with_ansi(true).init();
    }

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Connects the database pool, or `None` when no URL is configured.
///
/// # Errors
/// Returns the driver error when a configured database cannot be reached.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<Option<sqlx::PgPool>, sqlx::Error> {
    let Some(url) = db.url.as_deref() else {
        info!("no database configured, using in-memory stores");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .acquire_timeout(db.acquire_timeout())
        .connect(url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(Some(pool))
}

/// Connects the broker, falling back to the in-process bus when no URL is
/// configured or the configured broker is unreachable. The fallback only
/// fans out within this process.
pub async fn create_broker(config: &Config) -> Arc<dyn Broker> {
    match config.broker.url.as_deref() {
        Some(url) => match RedisBroker::connect(url).await {
            Ok(broker) => {
                info!("connected to redis broker");
                return Arc::new(broker);
            }
            Err(err) => {
                warn!(error = %err, "broker unavailable, using in-process bus");
            }
        },
        None => info!("no broker configured, using in-process bus"),
    }
    Arc::new(MemoryBus::new().broker())
}

/// The CORS layer. An empty origin list means any origin.
pub fn create_cors_layer(config: &Config) -> CorsLayer {
    use http::Method;

    let methods = vec![Method::GET, Method::POST, Method::OPTIONS];

    let mut cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::any())
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors = cors.allow_origin(AllowOrigin::any());
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| http::HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors = cors
            .allow_origin(AllowOrigin::list(origins))
            .allow_credentials(config.server.cors.allow_credentials);
    }

    cors
}

/// Assembles the full application router. Routes are registered before the
/// middleware stack is layered on, so every handler sees the extensions;
/// the request id middleware sits outside the trace layer so spans carry it.
pub fn create_app_router(
    state: Arc<AppState>,
    config: Arc<Config>,
    metrics_handle: PrometheusHandle,
    relay: ChannelRelay,
    chat: ChatLogService,
    presence: PresenceService,
) -> Router {
    let cors = create_cors_layer(&config);

    Router::new()
        .nest("/api", routes::create_api_router())
        .merge(routes::health::create_health_router())
        .merge(openapi_routes())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(config))
        .layer(Extension(metrics_handle))
        .layer(Extension(relay))
        .layer(Extension(chat))
        .layer(Extension(presence))
        .layer(tracer::create_trace_layer())
        .layer(middleware::from_fn(request_context::assign_request_id))
        .layer(cors)
        .with_state(state)
}

/// Resolves when the process receives CTRL+C.
pub async fn create_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    info!("shutting down");
}

/// Starts the server and blocks until shutdown completes.
///
/// # Errors
/// Returns an error when a configured database fails bootstrap, or when the
/// listener cannot bind, or when serving fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!("starting syncline server");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);

    let pool = match create_database_pool(&config.database).await {
        Ok(pool) => pool,
        Err(err) => {
            warn!(error = %err, "database unavailable, using in-memory stores");
            None
        }
    };
    if let Some(pool) = pool.as_ref() {
        bootstrap::ensure_liveness(pool)
            .await
            .context("database liveness probe failed")?;
        bootstrap::run(pool).await.context("database bootstrap failed")?;
    }

    let broker = create_broker(&config).await;
    let relay = ChannelRelay::new(broker, config.relay.stream_capacity);

    let chat_store: Arc<dyn ChatLogStore> = match pool.as_ref() {
        Some(pool) => Arc::new(PgChatLog::new(pool.clone())),
        None => Arc::new(MemoryChatLog::default()),
    };
    let presence_store: Arc<dyn PresenceStore> = match pool.as_ref() {
        Some(pool) => Arc::new(PgPresenceStore::new(pool.clone())),
        None => Arc::new(MemoryPresenceStore::default()),
    };

    let chat = ChatLogService::new(chat_store, relay.clone());
    let presence = PresenceService::new(presence_store, relay.clone(), config.presence.ttl());

    let shutdown_token = CancellationToken::new();
    let sweeper = spawn_presence_sweeper(
        presence.clone(),
        config.presence.sweep_interval(),
        shutdown_token.clone(),
    );

    let state = Arc::new(match pool {
        Some(pool) => AppState::with_pool(pool),
        None => AppState::default(),
    });
    let app = create_app_router(
        state,
        config.clone(),
        metrics_handle.clone(),
        relay.clone(),
        chat,
        presence,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    shutdown_token.cancel();
    sweeper.await.ok();
    relay.shutdown().await;
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{Value, json};
    use shared::config::Profile;
    use tower::ServiceExt;

    fn memory_router() -> Router {
        let config = Arc::new(Config::default_for_profile(Profile::Test));
        let relay = ChannelRelay::new(
            Arc::new(MemoryBus::new().broker()),
            config.relay.stream_capacity,
        );
        let chat = ChatLogService::new(Arc::new(MemoryChatLog::default()), relay.clone());
        let presence = PresenceService::new(
            Arc::new(MemoryPresenceStore::default()),
            relay.clone(),
            config.presence.ttl(),
        );
        create_app_router(
            Arc::new(AppState::default()),
            config,
            metrics_handle(),
            relay,
            chat,
            presence,
        )
    }

    #[tokio::test]
    async fn full_router_serves_every_surface() {
        for (uri, expected) in [
            ("/healthz", StatusCode::OK),
            ("/readyz", StatusCode::OK),
            ("/metrics", StatusCode::OK),
            ("/api-docs/openapi.json", StatusCode::OK),
            ("/api/stats", StatusCode::OK),
            ("/api/presence/room-1", StatusCode::OK),
            ("/nope", StatusCode::NOT_FOUND),
        ] {
            let response = memory_router()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "unexpected status for {uri}");
        }
    }

    #[tokio::test]
    async fn chat_write_flows_through_the_nested_api() {
        let router = memory_router();

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chats/c1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "messageId": "m1", "text": "hello" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let receipt: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(receipt["chatSequenceId"], 0);
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let response = memory_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn preflight_is_allowed_for_any_origin() {
        let response = memory_router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/stats")
                    .header("origin", "https://example.test")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|value| value.to_str().ok()),
            Some("*")
        );
    }
}
