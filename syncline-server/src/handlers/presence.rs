//! Presence endpoints: snapshot, upsert, heartbeat.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use shared::models::{HeartbeatRequest, HeartbeatResponse, PresenceUpdate, PresenceUpsertRequest};

use crate::http::error::AppResult;
use crate::http::problem::ProblemDetails;
use crate::services::PresenceService;

#[utoipa::path(
    get,
    path = "/presence/{channel_id}",
    params(("channel_id" = String, Path, description = "Channel identifier")),
    responses(
        (status = 200, description = "Current membership as upsert diffs", body = Vec<PresenceUpdate>),
        (status = 400, description = "Blank channel id", body = ProblemDetails)
    ),
    tag = "presence"
)]
pub async fn presence_snapshot(
    Extension(service): Extension<PresenceService>,
    Path(channel_id): Path<String>,
) -> AppResult<Json<Vec<PresenceUpdate>>> {
    Ok(Json(service.snapshot(&channel_id).await?))
}

#[utoipa::path(
    post,
    path = "/presence/{channel_id}",
    params(("channel_id" = String, Path, description = "Channel identifier")),
    request_body = PresenceUpsertRequest,
    responses(
        (status = 204, description = "Entry written and broadcast"),
        (status = 400, description = "Blank channel or client id", body = ProblemDetails)
    ),
    tag = "presence"
)]
pub async fn presence_upsert(
    Extension(service): Extension<PresenceService>,
    Path(channel_id): Path<String>,
    Json(request): Json<PresenceUpsertRequest>,
) -> AppResult<StatusCode> {
    service
        .upsert(&channel_id, &request.client_id, request.data)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/presence/{channel_id}/heartbeat",
    params(("channel_id" = String, Path, description = "Channel identifier")),
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "Whether the entry was refreshed; `false` asks the client to re-upsert", body = HeartbeatResponse),
        (status = 400, description = "Blank channel or client id", body = ProblemDetails)
    ),
    tag = "presence"
)]
pub async fn presence_heartbeat(
    Extension(service): Extension<PresenceService>,
    Path(channel_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> AppResult<Json<HeartbeatResponse>> {
    let refreshed = service.heartbeat(&channel_id, &request.client_id).await?;
    Ok(Json(HeartbeatResponse { refreshed }))
}
