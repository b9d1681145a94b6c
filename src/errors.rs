// ABOUTME: Unified error handling with standard error codes and HTTP responses
// ABOUTME: Defines AppError, ErrorCode, and the JSON error envelope returned by all routes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Unified Error Handling
//!
//! One error type crosses every layer of the server. Storage, crypto, the
//! upstream gateway, and the routes all speak [`AppError`]; axum turns it
//! into the JSON envelope below via [`IntoResponse`], so a failure looks
//! the same no matter where it originated:
//!
//! ```json
//! {"error": {"code": "RESOURCE_NOT_FOUND", "message": "Chat not found"}}
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Standard error codes used throughout the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Authentication (1000-1999)
    /// Request carried no credentials
    #[serde(rename = "AUTH_REQUIRED")]
    AuthRequired = 1000,
    /// Credentials present but rejected
    #[serde(rename = "AUTH_INVALID")]
    AuthInvalid = 1001,
    /// Token expired
    #[serde(rename = "AUTH_EXPIRED")]
    AuthExpired = 1002,

    // Validation (3000-3999)
    /// Request payload failed validation
    #[serde(rename = "INVALID_INPUT")]
    InvalidInput = 3000,

    // Resources (4000-4999)
    /// Resource does not exist, or is not visible to the caller
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound = 4000,
    /// Resource already exists
    #[serde(rename = "RESOURCE_ALREADY_EXISTS")]
    ResourceAlreadyExists = 4001,
    /// Resource exists but its state forbids the operation
    #[serde(rename = "RESOURCE_CONFLICT")]
    ResourceConflict = 4002,

    // Upstream provider (5000-5999)
    /// Upstream provider returned an error
    #[serde(rename = "EXTERNAL_SERVICE_ERROR")]
    ExternalServiceError = 5000,
    /// Upstream reachable but produced no usable stream
    #[serde(rename = "EXTERNAL_SERVICE_UNAVAILABLE")]
    ExternalServiceUnavailable = 5001,
    /// Upstream rate limited the request
    #[serde(rename = "EXTERNAL_RATE_LIMITED")]
    ExternalRateLimited = 5002,

    // Configuration (6000-6999)
    /// Configuration error encountered
    #[serde(rename = "CONFIG_ERROR")]
    ConfigError = 6000,
    /// Stored configuration (e.g. a sealed provider key) is no longer usable
    #[serde(rename = "CONFIG_INVALID")]
    ConfigInvalid = 6001,

    // Internal (9000-9999)
    /// Unexpected internal failure
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError = 9000,
    /// Database operation failed
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError = 9001,
}

impl ErrorCode {
    /// HTTP status this code maps to
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::AuthRequired | Self::AuthInvalid | Self::AuthExpired => 401,
            Self::InvalidInput => 400,
            Self::ResourceNotFound => 404,
            Self::ResourceAlreadyExists | Self::ResourceConflict => 409,
            Self::ExternalServiceError => 502,
            Self::ExternalServiceUnavailable => 503,
            Self::ExternalRateLimited => 429,
            Self::ConfigError | Self::ConfigInvalid | Self::InternalError | Self::DatabaseError => {
                500
            }
        }
    }

    /// Short description of the error class
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::AuthRequired | Self::AuthInvalid | Self::AuthExpired => "authentication",
            Self::InvalidInput => "validation",
            Self::ResourceNotFound | Self::ResourceAlreadyExists | Self::ResourceConflict => {
                "resource"
            }
            Self::ExternalServiceError
            | Self::ExternalServiceUnavailable
            | Self::ExternalRateLimited => "upstream",
            Self::ConfigError | Self::ConfigInvalid => "configuration",
            Self::InternalError | Self::DatabaseError => "internal",
        }
    }
}

/// Optional context attached to an error for tracing and diagnostics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Correlation ID for tracing
    pub request_id: Option<String>,
    /// Calling user, when known
    pub user_id: Option<Uuid>,
    /// Affected resource, when applicable
    pub resource_id: Option<String>,
    /// Free-form structured details
    pub details: Option<serde_json::Value>,
}

/// Unified error type for the application
#[derive(Debug, Error)]
pub struct AppError {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Attached context
    pub context: ErrorContext,
    /// Source error for chaining
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Build an error from a code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Attach a correlation ID
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.context.request_id = Some(request_id.into());
        self
    }

    /// Attach the calling user
    #[must_use]
    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.context.user_id = Some(user_id);
        self
    }

    /// Attach the affected resource
    #[must_use]
    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.context.resource_id = Some(resource_id.into());
        self
    }

    /// Attach structured details
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.context.details = Some(details);
        self
    }

    /// Attach a source error for chaining
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// HTTP status this error maps to
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    // ── Constructors for the common cases ───────────────────────────────

    /// Authentication required
    #[must_use]
    pub fn auth_required() -> Self {
        Self::new(ErrorCode::AuthRequired, "Authentication required")
    }

    /// Invalid authentication
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthInvalid, message)
    }

    /// Resource not found
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResourceNotFound,
            format!("{} not found", resource.into()),
        )
    }

    /// Resource already exists
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ResourceAlreadyExists,
            format!("{} already exists", resource.into()),
        )
    }

    /// Invalid input
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Upstream service error
    pub fn external_service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ExternalServiceError,
            format!("{}: {}", service.into(), message.into()),
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.code.class(), self.message)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(ErrorCode::InternalError, error.to_string())
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

// ============================================================================
// HTTP envelope
// ============================================================================

/// JSON error envelope returned by every route
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorResponseDetails,
}

/// Body of the error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponseDetails {
    /// Machine-readable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Correlation ID when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Structured details when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        Self {
            error: ErrorResponseDetails {
                code: error.code,
                message: error.message,
                request_id: error.context.request_id,
                details: error.context.details,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::from(self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::AuthRequired.http_status(), 401);
        assert_eq!(ErrorCode::ResourceNotFound.http_status(), 404);
        assert_eq!(ErrorCode::ResourceAlreadyExists.http_status(), 409);
        assert_eq!(ErrorCode::ExternalRateLimited.http_status(), 429);
        assert_eq!(ErrorCode::DatabaseError.http_status(), 500);
    }

    #[test]
    fn test_context_builders() {
        let error = AppError::auth_required()
            .with_request_id("req-123")
            .with_user_id(Uuid::new_v4())
            .with_resource_id("chat-9");

        assert_eq!(error.code, ErrorCode::AuthRequired);
        assert_eq!(error.context.request_id.as_deref(), Some("req-123"));
        assert!(error.context.user_id.is_some());
        assert_eq!(error.context.resource_id.as_deref(), Some("chat-9"));
    }

    #[test]
    fn test_envelope_serialization() {
        let error = AppError::not_found("Streaming record");
        let json = serde_json::to_string(&ErrorResponse::from(error)).unwrap();

        assert!(json.contains("RESOURCE_NOT_FOUND"));
        assert!(json.contains("Streaming record not found"));
        // Absent context fields stay out of the wire format
        assert!(!json.contains("request_id"));
    }

    #[test]
    fn test_display_includes_class() {
        let error = AppError::database("write failed");
        assert_eq!(error.to_string(), "internal error: write failed");
    }
}
