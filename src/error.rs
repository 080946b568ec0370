use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::ErrorResponse;

/// Failures surfaced by `POST /predict`.
///
/// Display strings are the exact `error` values sent to the client.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("No file part in the request")]
    MissingFilePart,

    #[error("No selected file")]
    NoFileSelected,

    #[error("Unidentified image format")]
    UnrecognizedImageFormat,

    #[error("File exceeds the {0} byte upload limit")]
    PayloadTooLarge(usize),

    #[error("{0}")]
    InternalInferenceError(String),
}

impl PredictError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        PredictError::InternalInferenceError(err.to_string())
    }
}

impl ResponseError for PredictError {
    fn status_code(&self) -> StatusCode {
        match self {
            PredictError::MissingFilePart
            | PredictError::NoFileSelected
            | PredictError::UnrecognizedImageFormat => StatusCode::BAD_REQUEST,
            PredictError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PredictError::InternalInferenceError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}
