// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP error responses.
//!
//! Every error returned by the API carries:
//! - A user-facing message with no internal details
//! - A unique reference code that also appears in the server log
//!
//! Internal details are logged with secrets and file paths removed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::download::DownloadError;
use crate::utils::redact_secrets;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

/// Error types for API responses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// Invalid request from client (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Resource not found (404)
    NotFound {
        message: String,
        reference: String,
    },

    /// Request entity too large (413)
    PayloadTooLarge {
        message: String,
        reference: String,
        max_size: Option<u64>,
    },

    /// Service temporarily unavailable (503)
    ServiceUnavailable {
        message: String,
        reference: String,
        retry_after_secs: Option<u64>,
    },

    /// Internal server error (500); never exposes internal details
    InternalError {
        message: String,
        reference: String,
    },
}

impl UserError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::NotFound { .. } => StatusCode::NOT_FOUND,
            UserError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UserError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UserError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the reference code for this error.
    pub fn reference(&self) -> &str {
        match self {
            UserError::InvalidRequest { reference, .. }
            | UserError::NotFound { reference, .. }
            | UserError::PayloadTooLarge { reference, .. }
            | UserError::ServiceUnavailable { reference, .. }
            | UserError::InternalError { reference, .. } => reference,
        }
    }

    /// Get the user-facing message.
    pub fn message(&self) -> &str {
        match self {
            UserError::InvalidRequest { message, .. }
            | UserError::NotFound { message, .. }
            | UserError::PayloadTooLarge { message, .. }
            | UserError::ServiceUnavailable { message, .. }
            | UserError::InternalError { message, .. } => message,
        }
    }
}

/// User-facing error response structure (JSON format).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::debug!(
            status = status.as_u16(),
            reference = %self.reference(),
            message = %self.message(),
            "Returning error response"
        );
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        (status, [("content-type", "application/json")], body).into_response()
    }
}

// =============================================================================
// ERROR CONSTRUCTORS (WITH LOGGING)
// =============================================================================

impl UserError {
    /// Create an InvalidRequest error.
    pub fn invalid_request(user_message: &str, field: Option<&str>, internal_details: Option<&str>) -> Self {
        let reference = generate_reference_code();

        if let Some(details) = internal_details {
            let sanitized = sanitize_error_details(details);
            tracing::warn!(
                reference = %reference,
                internal_details = %sanitized,
                field = ?field,
                "Invalid request"
            );
        }

        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();

        tracing::info!(
            reference = %reference,
            resource = %resource,
            "Resource not found"
        );

        Self::NotFound {
            message: format!("The requested {} was not found.", resource),
            reference,
        }
    }

    /// Create a PayloadTooLarge error.
    pub fn payload_too_large(max_size: u64) -> Self {
        let reference = generate_reference_code();

        tracing::warn!(
            reference = %reference,
            max_size = %max_size,
            "Payload too large"
        );

        Self::PayloadTooLarge {
            message: format!("Request body too large. Maximum size is {} bytes.", max_size),
            reference,
            max_size: Some(max_size),
        }
    }

    /// Create a ServiceUnavailable error, logging full details internally.
    pub fn service_unavailable(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);

        tracing::error!(
            reference = %reference,
            internal_error = %sanitized,
            "Service unavailable"
        );

        Self::ServiceUnavailable {
            message: "Service temporarily unavailable. Please try again later.".to_string(),
            reference,
            retry_after_secs: Some(30),
        }
    }

    /// Create an InternalError, logging full details internally.
    pub fn internal_error(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);

        tracing::error!(
            reference = %reference,
            internal_error = %sanitized,
            "Internal server error"
        );

        Self::InternalError {
            message: format!("An internal error occurred. Reference: {}", reference),
            reference,
        }
    }
}

impl From<DownloadError> for UserError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::NotFound(_) => UserError::not_found("download job"),
            DownloadError::ManagerClosed => UserError::service_unavailable(&error.to_string()),
            DownloadError::InvalidTransition { .. } => UserError::internal_error(&error.to_string()),
        }
    }
}

// =============================================================================
// ERROR SANITIZATION
// =============================================================================

/// File path patterns removed from logged error details.
static PATH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"),
        Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root|Users)/[^\s]+").expect("Unix path regex"),
    ]
});

/// Remove secrets and absolute file paths from error details.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = redact_secrets(error);
    for pattern in PATH_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[PATH_REDACTED]").to_string();
    }
    result
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================

/// Result type that uses UserError for the error variant.
pub type ApiResult<T> = Result<T, UserError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::JobId;

    #[test]
    fn test_generate_reference_code() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19); // ERR-YYYYMMDD-XXXXXX = 4+8+1+6

        let code2 = generate_reference_code();
        assert_ne!(code, code2);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            UserError::invalid_request("test", None, None).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            UserError::not_found("download job").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            UserError::payload_too_large(1024).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            UserError::service_unavailable("test").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            UserError::internal_error("test").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_download_error_mapping() {
        let err: UserError = DownloadError::NotFound(JobId::from("hfjob-x")).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: UserError = DownloadError::ManagerClosed.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.reference().starts_with("ERR-"));
    }

    #[test]
    fn test_sanitize_paths_and_tokens() {
        let sanitized = sanitize_error_details(
            "Failed writing /home/user/models/x.part with hf_AbCdEfGhIjKlMnOpQrStUvWx",
        );
        assert!(!sanitized.contains("/home/user"));
        assert!(!sanitized.contains("hf_AbCd"));
        assert!(sanitized.contains("[PATH_REDACTED]"));
    }

    #[test]
    fn test_internal_error_never_exposes_details() {
        let user_error = UserError::internal_error("disk full at /var/lib/playground/models");
        let message = user_error.message();
        assert!(!message.contains("/var/lib"));
        assert!(message.contains("Reference:"));
    }

    #[test]
    fn test_user_error_serialization() {
        let error = UserError::invalid_request("Bad input", Some("model_id"), None);
        let json = serde_json::to_string(&error).unwrap();

        assert!(json.contains("invalid_request"));
        assert!(json.contains("Bad input"));
        assert!(json.contains("model_id"));
        assert!(json.contains("reference"));
    }
}
