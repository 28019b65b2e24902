use axum::{http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::relay::RelayError;
use crate::services::{ChatLogError, PresenceError};

/// Handler result with the API error surface.
pub type AppResult<T> = Result<T, ApiError>;

/// An error ready to leave the process: status, stable code, and message,
/// rendered as an RFC 7807 body. Domain errors convert into this at the
/// handler boundary.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    /// An error with an explicit status and code.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    /// 400 with code `validation_failed`.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_failed", message)
    }

    /// 404 with code `not_found`.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 503 with a caller-supplied code, for transient conditions worth a
    /// retry.
    #[must_use]
    pub fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    /// 500 with code `internal_error`.
    #[must_use]
    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// Attaches structured context carried into the problem body.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal_server_error(value.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err
                .code()
                .unwrap_or_else(|| std::borrow::Cow::Borrowed("unknown"));
            let message = format!("database error {code}");
            return Self::internal_server_error(message)
                .with_details(json!({ "sqlstate": code, "message": db_err.message() }));
        }

        Self::internal_server_error(err.to_string())
    }
}

impl From<ChatLogError> for ApiError {
    fn from(err: ChatLogError) -> Self {
        match err {
            ChatLogError::Validation(message) => Self::bad_request(message),
            ChatLogError::Contention(attempts) => {
                Self::unavailable("sequence_contention", "concurrent writers, retry the upsert")
                    .with_details(json!({ "attempts": attempts }))
            }
            ChatLogError::Database(db_err) => Self::from(db_err),
        }
    }
}

impl From<PresenceError> for ApiError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::Validation(message) => Self::bad_request(message),
            PresenceError::Database(db_err) => Self::from(db_err),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Broker(broker_err) => {
                Self::unavailable("broker_unavailable", broker_err.to_string())
            }
            RelayError::ShutDown => Self::unavailable("shutting_down", "server is shutting down"),
            RelayError::Encode(encode_err) => Self::internal_server_error(encode_err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;

    #[test]
    fn new_sets_fields_and_allows_details() {
        let error = ApiError::not_found("nope").with_details(json!({ "resource": "chat" }));
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, "not_found");
        assert!(
            error
                .details
                .as_ref()
                .is_some_and(|details| details["resource"] == Value::from("chat"))
        );
    }

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::bad_request("limit out of range")
            .with_details(json!({ "limit": 0 }))
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value =
            serde_json::from_slice(&bytes).expect("problem details deserializes to json");
        assert_eq!(json["code"], "validation_failed");
        assert_eq!(json["message"], "limit out of range");
        assert_eq!(json["details"]["limit"], 0);
        assert_eq!(
            json["type"],
            "https://syncline.dev/problems/validation_failed"
        );
    }

    #[test]
    fn chat_log_errors_map_to_matching_status_codes() {
        let validation = ApiError::from(ChatLogError::Validation("bad".into()));
        assert_eq!(validation.status, StatusCode::BAD_REQUEST);

        let contention = ApiError::from(ChatLogError::Contention(3));
        assert_eq!(contention.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(contention.code, "sequence_contention");

        let db = ApiError::from(ChatLogError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(db.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn relay_errors_surface_as_service_unavailable() {
        let shut_down = ApiError::from(RelayError::ShutDown);
        assert_eq!(shut_down.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(shut_down.code, "shutting_down");
    }

    #[test]
    fn presence_validation_is_a_client_error() {
        let err = ApiError::from(PresenceError::Validation("blank id".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
