use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::inference::TranscribeError;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct SpeechRunnerError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl IntoResponse for SpeechRunnerError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl From<TranscribeError> for SpeechRunnerError {
    fn from(err: TranscribeError) -> Self {
        let status = match &err {
            TranscribeError::ModelUnavailable(_) | TranscribeError::TokenizerUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TranscribeError::AudioProcessingFailed(_)
            | TranscribeError::FeatureExtractionFailed(_)
            | TranscribeError::PrepareDecoderInputsFailed(_) => StatusCode::BAD_REQUEST,
            TranscribeError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        SpeechRunnerError {
            status,
            message: HttpErrorResponse::from(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for SpeechRunnerError {
    fn from(err: anyhow::Error) -> Self {
        SpeechRunnerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: HttpErrorResponse::from(err.to_string()),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for SpeechRunnerError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        SpeechRunnerError {
            status: StatusCode::BAD_REQUEST,
            message: HttpErrorResponse::from(err.to_string()),
        }
    }
}

pub type HttpResult<T, E = SpeechRunnerError> = Result<T, E>;

/// Builds a [`SpeechRunnerError`] value.
#[macro_export]
macro_rules! runner {
    ($status_code:expr, $error_message:expr) => {
        $crate::error::SpeechRunnerError {
            status: $status_code,
            message: $crate::error::HttpErrorResponse::from($error_message),
        }
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        $crate::error::SpeechRunnerError {
            status: $status,
            message: $crate::error::HttpErrorResponse::from(format!($fmt $(, $arg)*)),
        }
    };
}

/// Returns early with a [`SpeechRunnerError`].
#[macro_export]
macro_rules! bail_runner {
    ($error_message:expr) => {
        return Err($crate::runner!(axum::http::StatusCode::INTERNAL_SERVER_ERROR, $error_message))
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::runner!($status_code, $error_message))
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::runner!($status, $fmt $(, $arg)*))
    };
}
