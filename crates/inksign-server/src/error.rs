//! Engine errors as HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use inksign_core::{EngineError, FieldId};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{0}")]
    BadRequest(String),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// One rejected field of a submission.
#[derive(Debug, Serialize)]
pub struct FieldProblem {
    pub field_id: FieldId,
    pub reason: String,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldProblem>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::Validation(_)
                | EngineError::OutOfBounds(_)
                | EngineError::InvalidSetup(_)
                | EngineError::IncompleteSetup(_)
                | EngineError::Document(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::OrderViolation { .. } => StatusCode::FORBIDDEN,
                EngineError::Conflict { .. }
                | EngineError::InvalidState { .. }
                | EngineError::NotReady { .. } => StatusCode::CONFLICT,
                EngineError::NotFound(_) | EngineError::UnknownSigner(_) | EngineError::UnknownToken => {
                    StatusCode::NOT_FOUND
                }
                EngineError::Render(_) | EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Engine(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Worker(_) => "internal",
        }
    }

    pub fn body(&self) -> ErrorBody {
        let fields = match self {
            ApiError::Engine(EngineError::Validation(errors)) => errors
                .iter()
                .map(|e| FieldProblem {
                    field_id: e.field_id,
                    reason: e.reason.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            fields,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inksign_core::{EnvelopeStatus, FieldError, FieldRejection, ValidationErrors};
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let conflict = ApiError::from(EngineError::Conflict { expected: 2, found: 3 });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.kind(), "conflict");

        let missing = ApiError::from(EngineError::NotFound(Uuid::new_v4()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let not_ready = ApiError::from(EngineError::NotReady {
            status: EnvelopeStatus::Sent,
        });
        assert_eq!(not_ready.status(), StatusCode::CONFLICT);

        let bad = ApiError::BadRequest("nope".to_string());
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(bad.kind(), "bad_request");
    }

    #[test]
    fn test_validation_body_lists_fields() {
        let field_id = Uuid::new_v4();
        let err = ApiError::from(EngineError::Validation(ValidationErrors(vec![FieldError {
            field_id,
            reason: FieldRejection::AlreadyFilled,
        }])));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = serde_json::to_value(err.body()).unwrap();
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["fields"][0]["field_id"], field_id.to_string());
        assert_eq!(body["fields"][0]["reason"], "field is already filled");
    }
}
