use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use tracing::debug;

use sketch_types::SketchError;
use sketch_types::api::ErrorBody;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error returned by every handler: a status from the taxonomy plus `{error, details?}`.
#[derive(Debug)]
pub struct ApiError {
    pub error: SketchError,
    pub details: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.error {
            SketchError::Auth => StatusCode::UNAUTHORIZED,
            SketchError::Validation(_) => StatusCode::BAD_REQUEST,
            SketchError::NotFound(_) => StatusCode::NOT_FOUND,
            SketchError::Forbidden(_) => StatusCode::FORBIDDEN,
            SketchError::Conflict(_) => StatusCode::CONFLICT,
            SketchError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn with_details(error: SketchError, details: String) -> Self {
        Self {
            error,
            details: Some(details),
        }
    }
}

impl From<SketchError> for ApiError {
    fn from(error: SketchError) -> Self {
        Self {
            error,
            details: None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::with_details(
            SketchError::validation("malformed request body"),
            rejection.body_text(),
        )
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::with_details(
            SketchError::validation("malformed path parameter"),
            rejection.body_text(),
        )
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::with_details(
            SketchError::validation("malformed query string"),
            rejection.body_text(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!("Request rejected ({}): {}", self.error.kind(), self.error);
        let body = ErrorBody {
            error: self.error.to_string(),
            details: self.details,
        };
        (status, Json(body)).into_response()
    }
}
