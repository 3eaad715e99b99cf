use crate::{services::store::StoreError, signing::SigningError};
use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::fmt;

/// Emulator error rendered as a Cloud Storage XML error document.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, error code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
    }

    /// Shortcut for 403 AccessDenied
    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "AccessDenied", msg)
    }

    /// Shortcut for 400 Bad Request with a specific code
    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = gcs_error_xml(self.code, &self.message);
        (
            self.status,
            [(header::CONTENT_TYPE, "application/xml")],
            body,
        )
            .into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BucketNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "NoSuchBucket", err.to_string())
            }
            StoreError::ObjectNotFound { .. } => {
                AppError::new(StatusCode::NOT_FOUND, "NoSuchKey", err.to_string())
            }
            StoreError::PermissionDenied { .. } => AppError::access_denied(err.to_string()),
            StoreError::Unexpected { status, ref message } => AppError::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "InvalidRequest",
                message.clone(),
            ),
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<SigningError> for AppError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::SignatureMismatch | SigningError::UnknownAccessId(_) => AppError::new(
                StatusCode::FORBIDDEN,
                "SignatureDoesNotMatch",
                err.to_string(),
            ),
            SigningError::ClockSkew => AppError::new(
                StatusCode::FORBIDDEN,
                "RequestTimeTooSkewed",
                err.to_string(),
            ),
            SigningError::Expired(_) => AppError::bad_request("ExpiredToken", err.to_string()),
            other => AppError::bad_request("AuthorizationHeaderMalformed", other.to_string()),
        }
    }
}

/// Cloud Storage XML error document.
pub fn gcs_error_xml(code: &str, message: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "<Error><Code>{}</Code><Message>{}</Message></Error>"
        ),
        xml_escape(code),
        xml_escape(message)
    )
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
