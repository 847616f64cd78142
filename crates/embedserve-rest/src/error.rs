//! Mapping of pipeline failures onto HTTP responses.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use embedserve_core::{ErrorKind, PipelineError};
use serde_json::{json, Value};
use thiserror::Error;

/// Error returned by every handler.
///
/// Serialized as `{"error": {"kind", "message", "details"?}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The request body or query string could not be decoded.
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Pipeline(error) => status_for(error),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pipeline(error) => error.kind(),
            Self::BadRequest(_) => ErrorKind::Validation,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::Pipeline(PipelineError::NoViableChunks { errors }) => {
                serde_json::to_value(errors).ok()
            }
            _ => None,
        }
    }
}

/// HTTP status for a pipeline error.
///
/// A request where every item failed takes the status of its failures:
/// 503 when all of them are retryable, 422 when all are tokenization
/// failures, 500 otherwise.
#[must_use]
pub fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Tokenization { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::UnknownModel { .. } => StatusCode::NOT_FOUND,
        PipelineError::Overloaded { .. }
        | PipelineError::ModelNotReady { .. }
        | PipelineError::ModelLoad { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Inference { .. } | PipelineError::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        PipelineError::NoViableChunks { errors } => {
            if error.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else if errors.iter().all(|e| e.kind == ErrorKind::Tokenization) {
                StatusCode::UNPROCESSABLE_ENTITY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        } else {
            tracing::warn!(status = %status, error = %self, "Request rejected");
        }

        let mut body = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }

        (status, Json(json!({ "error": body }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedserve_core::ItemError;

    fn item(kind: ErrorKind) -> ItemError {
        ItemError {
            index: 0,
            chunk_index: Some(0),
            kind,
            message: kind.to_string(),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&PipelineError::Validation("empty".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PipelineError::unknown_model("nope")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&PipelineError::Timeout { timeout_ms: 10 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&PipelineError::ModelNotReady {
                name: "m".into(),
                status: "loading".into(),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&PipelineError::inference("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_no_viable_chunks_status_follows_failures() {
        let overloaded = PipelineError::NoViableChunks {
            errors: vec![item(ErrorKind::Overloaded), item(ErrorKind::Timeout)],
        };
        assert_eq!(status_for(&overloaded), StatusCode::SERVICE_UNAVAILABLE);

        let tokenization = PipelineError::NoViableChunks {
            errors: vec![item(ErrorKind::Tokenization)],
        };
        assert_eq!(status_for(&tokenization), StatusCode::UNPROCESSABLE_ENTITY);

        let mixed = PipelineError::NoViableChunks {
            errors: vec![item(ErrorKind::Tokenization), item(ErrorKind::Inference)],
        };
        assert_eq!(status_for(&mixed), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_details_only_for_item_failures() {
        let err = ApiError::from(PipelineError::NoViableChunks {
            errors: vec![item(ErrorKind::Inference)],
        });
        let details = err.details().unwrap();
        assert_eq!(details[0]["kind"], "inference");

        assert!(ApiError::BadRequest("bad".into()).details().is_none());
    }
}
