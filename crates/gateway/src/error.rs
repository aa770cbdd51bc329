//! Mapping of service errors onto HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use turnstile_core::error::{FailureOrigin, RejectKind, ServiceError};

/// A [`ServiceError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

/// Malformed or oversized bodies are caller errors like any other.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let kind = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            RejectKind::ContentTooLong
        } else {
            RejectKind::InvalidInput
        };
        Self(ServiceError::rejected(kind, rejection.body_text()))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<&'static str>,
}

/// HTTP status for a service error.
pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Rejected { kind, .. } => match kind {
            RejectKind::InvalidInput | RejectKind::UnknownModel => StatusCode::BAD_REQUEST,
            RejectKind::ContentTooLong => StatusCode::PAYLOAD_TOO_LARGE,
            RejectKind::UnknownSession => StatusCode::NOT_FOUND,
            RejectKind::SessionExists => StatusCode::CONFLICT,
        },
        ServiceError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ServiceError::Failed { origin, .. } => match origin {
            FailureOrigin::Provider => StatusCode::BAD_GATEWAY,
            FailureOrigin::Store => StatusCode::SERVICE_UNAVAILABLE,
            FailureOrigin::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let origin = match &self.0 {
            ServiceError::Failed { origin, .. } => Some(origin.as_str()),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind(),
                message: self.0.public_message(),
                origin,
            },
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_client_errors() {
        let cases = [
            (RejectKind::InvalidInput, StatusCode::BAD_REQUEST),
            (RejectKind::UnknownModel, StatusCode::BAD_REQUEST),
            (RejectKind::ContentTooLong, StatusCode::PAYLOAD_TOO_LARGE),
            (RejectKind::UnknownSession, StatusCode::NOT_FOUND),
            (RejectKind::SessionExists, StatusCode::CONFLICT),
        ];
        for (kind, status) in cases {
            assert_eq!(status_for(&ServiceError::rejected(kind, "x")), status);
        }
    }

    #[test]
    fn failures_map_by_origin() {
        let failed = |origin| ServiceError::Failed {
            origin,
            detail: "boom".into(),
        };
        assert_eq!(status_for(&failed(FailureOrigin::Provider)), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&failed(FailureOrigin::Store)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&failed(FailureOrigin::Internal)),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&ServiceError::GenerationTimeout { after_secs: 30 }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
