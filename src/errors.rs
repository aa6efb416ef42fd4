use crate::services::datastream_service::DatastreamError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// HTTP-facing error: a status and a message safe to show to clients.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Datastream messages are already generic; only the status is chosen here.
impl From<DatastreamError> for AppError {
    fn from(err: DatastreamError) -> Self {
        match err {
            DatastreamError::FileNotFound(_)
            | DatastreamError::NotFound { .. }
            | DatastreamError::ObjectNotFoundOnDelete { .. } => AppError::not_found(err.to_string()),
            DatastreamError::UnsupportedCloudType(_) | DatastreamError::InvalidReference(_) => {
                AppError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            DatastreamError::UploadFailed
            | DatastreamError::DownloadFailed
            | DatastreamError::RemoveFailed => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            DatastreamError::Relation(_) => AppError::internal(err.to_string()),
        }
    }
}
