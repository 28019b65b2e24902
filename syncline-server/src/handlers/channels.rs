//! Channel endpoints: the SSE subscribe stream, publish, and relay stats.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use shared::config::Config;
use shared::models::UpdateEnvelope;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::http::error::AppResult;
use crate::http::problem::ProblemDetails;
use crate::relay::ChannelRelay;

/// Query parameters accepted by the subscribe endpoint.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct SubscribeParams {
    /// Identity of this connection. Updates originating from it are not
    /// echoed back on this stream.
    pub client_id: Option<String>,
}

/// Local relay occupancy.
#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    /// Subscriber count per channel name, this process only.
    pub channels: BTreeMap<String, usize>,
}

#[utoipa::path(
    get,
    path = "/channels/{channel}/subscribe",
    params(
        ("channel" = String, Path, description = "Channel name, e.g. `channel:room-1` or `presence:room-1`"),
        SubscribeParams
    ),
    responses(
        (status = 200, description = "SSE stream of update envelopes", content_type = "text/event-stream"),
        (status = 503, description = "Broker unavailable or server shutting down", body = ProblemDetails)
    ),
    tag = "channels"
)]
pub async fn subscribe_channel(
    Extension(config): Extension<Arc<Config>>,
    Extension(relay): Extension<ChannelRelay>,
    Path(channel): Path<String>,
    Query(params): Query<SubscribeParams>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (guard, receiver) = relay.subscribe(&channel, params.client_id).await?;
    info!(%channel, stream = %guard.id(), "SSE stream opened");

    // The guard lives inside the stream closure, so any way the response
    // ends (disconnect, error, shutdown) releases the registration.
    let stream = ReceiverStream::new(receiver).map(move |payload| {
        let _keep = &guard;
        Ok::<_, Infallible>(Event::default().data(payload))
    });

    let keepalive = KeepAlive::new()
        .interval(config.relay.keep_alive())
        .text("keep-alive");
    Ok(Sse::new(stream).keep_alive(keepalive))
}

#[utoipa::path(
    post,
    path = "/channels/{channel}/publish",
    params(("channel" = String, Path, description = "Channel name")),
    request_body = UpdateEnvelope,
    responses(
        (status = 202, description = "Envelope handed to the broker"),
        (status = 503, description = "Broker unavailable or server shutting down", body = ProblemDetails)
    ),
    tag = "channels"
)]
pub async fn publish_channel(
    Extension(relay): Extension<ChannelRelay>,
    Path(channel): Path<String>,
    Json(envelope): Json<UpdateEnvelope>,
) -> AppResult<StatusCode> {
    relay.publish(&channel, &envelope).await?;
    Ok(StatusCode::ACCEPTED)
}

#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Local subscriber counts", body = StatsResponse)),
    tag = "channels"
)]
pub async fn channel_stats(Extension(relay): Extension<ChannelRelay>) -> Json<StatsResponse> {
    Json(StatsResponse {
        channels: relay.stats().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBus;
    use axum::{
        Router,
        body::Body,
        http::Request,
        routing::{get, post},
    };
    use serde_json::{Value, json};
    use shared::config::Profile;
    use std::time::Duration;
    use tokio::time::timeout;
    use tower::ServiceExt;

    fn test_router() -> (Router, ChannelRelay) {
        let relay = ChannelRelay::new(Arc::new(MemoryBus::new().broker()), 8);
        let config = Arc::new(Config::default_for_profile(Profile::Test));
        let router = Router::new()
            .route("/channels/{channel}/subscribe", get(subscribe_channel))
            .route("/channels/{channel}/publish", post(publish_channel))
            .route("/stats", get(channel_stats))
            .layer(Extension(relay.clone()))
            .layer(Extension(config));
        (router, relay)
    }

    fn publish_request(channel: &str, envelope: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/channels/{channel}/publish"))
            .header("content-type", "application/json")
            .body(Body::from(envelope.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn publish_is_accepted() {
        let (router, _relay) = test_router();
        let envelope = json!({ "clientId": null, "domainMessages": [{ "n": 1 }] });

        let response = router
            .oneshot(publish_request("channel:c1", &envelope))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn subscribe_streams_published_envelopes() {
        let (router, relay) = test_router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/channels/channel:c1/subscribe?clientId=reader")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok()),
            Some("text/event-stream")
        );

        relay
            .publish(
                "channel:c1",
                &UpdateEnvelope::new(Some("writer".into()), vec![json!({ "body": "hi" })]),
            )
            .await
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let frame = timeout(Duration::from_secs(1), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("data:"));
        assert!(text.contains("domainMessages"));
    }

    #[tokio::test]
    async fn subscriber_never_sees_its_own_writes() {
        let (router, relay) = test_router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/channels/channel:c1/subscribe?clientId=writer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        relay
            .publish(
                "channel:c1",
                &UpdateEnvelope::new(Some("writer".into()), vec![json!({ "n": 1 })]),
            )
            .await
            .unwrap();
        relay
            .publish(
                "channel:c1",
                &UpdateEnvelope::new(Some("other".into()), vec![json!({ "n": 2 })]),
            )
            .await
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let frame = timeout(Duration::from_secs(1), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("\"other\""));
        assert!(!text.contains("\"n\":1"));
    }

    #[tokio::test]
    async fn stream_closure_releases_the_registration() {
        let (router, relay) = test_router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/channels/channel:c1/subscribe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(relay.stats().await.get("channel:c1"), Some(&1));

        drop(response);
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(relay.stats().await.is_empty());
    }

    #[tokio::test]
    async fn stats_reports_local_counts() {
        let (router, relay) = test_router();
        let (_guard, _rx) = relay.subscribe("channel:c1", None).await.unwrap();

        let response = router
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["channels"]["channel:c1"], 1);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_is_unavailable() {
        let (router, relay) = test_router();
        relay.shutdown().await;

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/channels/channel:c1/subscribe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "shutting_down");
    }
}
