use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult};

/// Name of the request correlation header, accepted inbound and echoed on
/// every response.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request context available to handlers via extensions.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Correlation id: taken from the inbound header or freshly generated.
    pub request_id: String,
}

/// Assigns a request id, stores it in extensions, and echoes it back on the
/// response so clients can correlate logs across processes.
///
/// # Errors
/// 500 if a caller-supplied id cannot be re-encoded as a header value.
pub async fn assign_request_id(mut request: Request<Body>, next: Next) -> AppResult<Response> {
    let request_id =
        extract_request_id(request.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
    });
    request.headers_mut().insert(
        REQUEST_ID_HEADER.clone(),
        HeaderValue::from_str(&request_id)
            .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?,
    );

    let mut response = next.run(request).await;
    response.headers_mut().insert(
        REQUEST_ID_HEADER.clone(),
        HeaderValue::from_str(&request_id)
            .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?,
    );

    Ok(response)
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
