//! API error handling.

use autopost_db::DbError;
use autopost_scheduler::PipelineError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<autopost_core::Error> for ApiError {
    fn from(err: autopost_core::Error) -> Self {
        match err {
            autopost_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            autopost_core::Error::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            autopost_core::Error::InvariantViolation(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => ApiError::NotFound(msg),
            DbError::Duplicate(msg) => ApiError::Conflict(msg),
            DbError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            DbError::Rejected(inner) => inner.into(),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Store(e) => e.into(),
            PipelineError::Job(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopost_core::{JobId, JobStatus};

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(DbError::NotFound("job x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(autopost_core::Error::InvalidInput("owner".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(autopost_core::Error::InvalidTransition {
                from: JobStatus::Posted,
                transition: "cancel",
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PipelineError::from(DbError::Conflict {
                id: JobId::from("x"),
                expected: "status queued".to_string(),
                actual: "status canceled".to_string(),
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(autopost_core::Error::InvariantViolation("lock".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(DbError::Corrupt("bad status".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
