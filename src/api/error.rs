use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::artifacts::ArtifactError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - No route matched.
    NotFound,
    /// 404 - The session has no artifact with this name.
    FileNotFound(String),
    /// 400 - Artifact name is not a plain file name.
    InvalidFileName(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "not_found",
            ApiError::FileNotFound(_) => "file_not_found",
            ApiError::InvalidFileName(_) => "invalid_file_name",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::FileNotFound(name) => format!("File not found: {}.", name),
            ApiError::InvalidFileName(name) => format!("Invalid file name: {}.", name),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::NotFound(name) => ApiError::FileNotFound(name),
            ArtifactError::InvalidName(name) => ApiError::InvalidFileName(name),
            ArtifactError::Io(e) => {
                tracing::error!(error = %e, "artifact store I/O failure");
                ApiError::InternalError("artifact storage unavailable".to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
