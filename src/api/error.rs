use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::training::TrainingError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(upload) = err.downcast_ref::<UploadError>() {
            return ApiError::BadRequest(upload.to_string());
        }
        if let Some(TrainingError::Busy) = err.downcast_ref::<TrainingError>() {
            return ApiError::Conflict(TrainingError::Busy.to_string());
        }
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        ApiError::Internal(err.to_string())
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<TrainingError> for ApiError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::Busy => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        // Busy responses also carry `message`, matching the /train success shape.
        let body = if status == StatusCode::CONFLICT {
            serde_json::json!({ "status": false, "error": message, "message": message })
        } else {
            serde_json::json!({ "status": false, "error": message })
        };

        (status, Json(body)).into_response()
    }
}
