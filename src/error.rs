use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

use crate::metadata::MetadataError;
use crate::runner::RunError;
use crate::tool::ToolError;

// Every failure a handler can return before a stream is opened.
#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
    InvalidRequest(String),
    RateLimited,
    NotFound(String),
    ToolUnavailable(String),
    ExtractionFailed(String),
    ParseFailed(String),
    DownloadFailed(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ToolUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ExtractionFailed(_)
            | AppError::ParseFailed(_)
            | AppError::DownloadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// This implementation allows us to convert our AppError into a valid HTTP response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = match self {
            AppError::Internal(e) => {
                // Log the full error for debugging
                tracing::error!("Internal server error: {:?}", e);
                ("An internal server error occurred".to_string(), None)
            }
            AppError::InvalidRequest(e) => (e, None),
            AppError::RateLimited => (
                "Too many download requests, please wait a minute and try again".to_string(),
                None,
            ),
            AppError::NotFound(e) => (e, None),
            AppError::ToolUnavailable(e) => ("Downloader is currently unavailable".to_string(), Some(e)),
            AppError::ExtractionFailed(e) | AppError::ParseFailed(e) => {
                ("Failed to process video information".to_string(), Some(e))
            }
            AppError::DownloadFailed(e) => ("Download failed".to_string(), Some(e)),
        };

        let body = Json(json!({ "error": error_message, "details": details }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ToolError> for AppError {
    fn from(err: ToolError) -> Self {
        tracing::warn!("yt-dlp unavailable: {}", err);
        Self::ToolUnavailable(err.to_string())
    }
}

impl From<RunError> for AppError {
    fn from(err: RunError) -> Self {
        Self::DownloadFailed(err.to_string())
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Tool(e) => e.into(),
            MetadataError::ExtractionFailed(msg) => Self::ExtractionFailed(msg),
            MetadataError::ParseFailed(msg) => Self::ParseFailed(msg),
        }
    }
}
