//! Chat endpoints: sequenced message upsert and windowed load.

use axum::{
    Json,
    extract::{Extension, Path, Query},
};
use serde::Deserialize;
use shared::models::{Message, MessageUpsert, UpsertReceipt};
use utoipa::IntoParams;

use crate::http::error::AppResult;
use crate::http::problem::ProblemDetails;
use crate::services::ChatLogService;

/// Matches the client's default reconciliation window.
const DEFAULT_LOAD_LIMIT: i64 = 10;

/// Query parameters accepted by the load endpoint.
#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct LoadParams {
    /// Maximum rows returned, newest first. Defaults to 10.
    pub limit: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/chats/{chat_id}/messages",
    params(("chat_id" = String, Path, description = "Chat identifier")),
    request_body = MessageUpsert,
    responses(
        (status = 200, description = "Row committed; sequencing assigned", body = UpsertReceipt),
        (status = 400, description = "Blank ids or an upsert with no fields", body = ProblemDetails),
        (status = 503, description = "Sequence contention; retry the upsert", body = ProblemDetails)
    ),
    tag = "chat"
)]
pub async fn upsert_message(
    Extension(service): Extension<ChatLogService>,
    Path(chat_id): Path<String>,
    Json(request): Json<MessageUpsert>,
) -> AppResult<Json<UpsertReceipt>> {
    Ok(Json(service.upsert(&chat_id, &request).await?))
}

#[utoipa::path(
    get,
    path = "/chats/{chat_id}/messages",
    params(
        ("chat_id" = String, Path, description = "Chat identifier"),
        LoadParams
    ),
    responses(
        (status = 200, description = "Latest surviving rows, newest first", body = Vec<Message>),
        (status = 400, description = "Blank chat id or out-of-range limit", body = ProblemDetails)
    ),
    tag = "chat"
)]
pub async fn load_messages(
    Extension(service): Extension<ChatLogService>,
    Path(chat_id): Path<String>,
    Query(params): Query<LoadParams>,
) -> AppResult<Json<Vec<Message>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LOAD_LIMIT);
    Ok(Json(service.load(&chat_id, limit).await?))
}
