//! # Error Handling
//!
//! Request-level errors and their HTTP mapping.
//!
//! ## What the Client Sees:
//! The legacy firmware only looks at the status code of a failed request, so
//! protocol and decode problems inside an upload are absorbed (see
//! [`crate::nmsp::chunks`] and [`crate::audio::utterance`]) and never reach
//! this type. What does reach it:
//!
//! | Variant | Status | When |
//! |---|---|---|
//! | `BadRequest` | 400 | missing or garbled content-type boundary |
//! | `PayloadError` | 400 | upload too large or broken off mid-stream |
//! | `ConfigError` | 400 | no usable recognition backend |
//! | `TranscriptionFailed` | 500 | every backend failed |
//! | `Internal` | 500 | anything else |
//!
//! ## Response Body:
//! `TranscriptionFailed` answers with the protocol's retry payload so the
//! device prompts the user again. Everything else gets a small JSON body:
//! ```json
//! { "error": { "type": "bad_request", "message": "...", "timestamp": "..." } }
//! ```

use crate::audio::DecodeError;
use crate::nmsp::{response_content_type, BoundaryError, ResponsePayload};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Server-side failure unrelated to the upload.
    Internal(String),

    /// The request itself is malformed.
    BadRequest(String),

    /// Recognition cannot run with the current backend selection.
    ConfigError(String),

    /// Every recognition backend failed for this utterance.
    TranscriptionFailed(String),

    /// The request body could not be read to the end.
    PayloadError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::TranscriptionFailed(msg) => write!(f, "Transcription failed: {}", msg),
            AppError::PayloadError(msg) => write!(f, "Payload error: {}", msg),
        }
    }
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ConfigError(_) => "config_error",
            AppError::TranscriptionFailed(_) => "transcription_failed",
            AppError::PayloadError(_) => "payload_error",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ConfigError(msg)
            | AppError::TranscriptionFailed(msg)
            | AppError::PayloadError(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::TranscriptionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ConfigError(_) | AppError::PayloadError(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let AppError::TranscriptionFailed(_) = self {
            if let Ok(body) = ResponsePayload::retry().encode() {
                return HttpResponse::build(self.status_code())
                    .content_type(response_content_type())
                    .body(body);
            }
        }

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("response encoding failed: {}", err))
    }
}

impl From<BoundaryError> for AppError {
    fn from(err: BoundaryError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        AppError::Internal(format!("speech codec unavailable: {}", err))
    }
}

impl From<actix_web::error::PayloadError> for AppError {
    fn from(err: actix_web::error::PayloadError) -> Self {
        AppError::PayloadError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::ConfigError("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::PayloadError("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::TranscriptionFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(AppError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn test_transcription_failure_carries_retry_payload() {
        let response = AppError::TranscriptionFailed("all backends down".into()).error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body()).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("name=\"QueryRetry\""));
        assert!(body.contains("AUDIO_INFO"));
    }

    #[actix_web::test]
    async fn test_json_error_body() {
        let response = AppError::BadRequest("content-type has no boundary parameter".into()).error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "bad_request");
        assert_eq!(value["error"]["message"], "content-type has no boundary parameter");
    }
}
