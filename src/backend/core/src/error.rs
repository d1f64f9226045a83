//! Error handling for Visionary Core.
//!
//! This module provides:
//! - A single crate error type with context and chaining
//! - Stable machine-readable error codes grouped by category
//! - HTTP status code mapping for API responses
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration and an error counter
//!
//! # Usage
//!
//! ```rust,ignore
//! use visionary_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn load_payload(raw: &str) -> Result<serde_json::Value> {
//!     serde_json::from_str(raw).with_error_code(ErrorCode::DeserializationError)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Visionary operations.
pub type Result<T> = std::result::Result<T, VisionaryError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Task Errors (1000-1099)
    UnknownTaskType,
    DuplicateRegistration,
    JobNotFound,
    InvalidRoutingRule,
    InvalidSchedule,

    // Execution Errors (1100-1199)
    HandlerError,
    TimeoutError,
    TerminalFailure,

    // Broker Errors (2000-2099)
    QueueUnavailable,
    QueueError,

    // Result Store Errors (2100-2199)
    ResultStoreUnavailable,
    ResultStoreError,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // External Service Errors (3000-3099)
    EventSinkError,
    NetworkError,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::UnknownTaskType => 1000,
            Self::DuplicateRegistration => 1001,
            Self::JobNotFound => 1002,
            Self::InvalidRoutingRule => 1003,
            Self::InvalidSchedule => 1004,

            Self::HandlerError => 1100,
            Self::TimeoutError => 1101,
            Self::TerminalFailure => 1102,

            Self::QueueUnavailable => 2000,
            Self::QueueError => 2001,

            Self::ResultStoreUnavailable => 2100,
            Self::ResultStoreError => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::EventSinkError => 3000,
            Self::NetworkError => 3001,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Not Found (404)
            Self::UnknownTaskType | Self::JobNotFound => StatusCode::NOT_FOUND,

            // Conflict (409)
            Self::DuplicateRegistration => StatusCode::CONFLICT,

            // Unprocessable Entity (422)
            Self::ValidationError
            | Self::InvalidInput
            | Self::DeserializationError => StatusCode::UNPROCESSABLE_ENTITY,

            // Timeout (504)
            Self::TimeoutError => StatusCode::GATEWAY_TIMEOUT,

            // Service Unavailable (503)
            Self::QueueUnavailable | Self::ResultStoreUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // Bad Gateway (502)
            Self::EventSinkError | Self::NetworkError => StatusCode::BAD_GATEWAY,

            // Internal Server Error (500)
            Self::InvalidRoutingRule
            | Self::InvalidSchedule
            | Self::HandlerError
            | Self::TerminalFailure
            | Self::QueueError
            | Self::ResultStoreError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HandlerError
                | Self::TimeoutError
                | Self::QueueUnavailable
                | Self::ResultStoreUnavailable
                | Self::NetworkError
        )
    }

    /// True for broker and result-store outages that a worker should back off from.
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::QueueUnavailable
                | Self::QueueError
                | Self::ResultStoreUnavailable
                | Self::ResultStoreError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "task",
            1100..=1199 => "execution",
            2000..=2099 => "broker",
            2100..=2199 => "result_store",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    /// Same spelling as the serialized form, e.g. `UNKNOWN_TASK_TYPE`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{:?}", self);
        for (i, ch) in name.char_indices() {
            if ch.is_ascii_uppercase() && i > 0 {
                f.write_str("_")?;
            }
            write!(f, "{}", ch.to_ascii_uppercase())?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown task types, bad input)
    Low,
    /// Operational issues (handler failures, timeouts)
    Medium,
    /// System errors (serialization, configuration)
    High,
    /// Infrastructure outages
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownTaskType
            | ErrorCode::JobNotFound
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::HandlerError
            | ErrorCode::TimeoutError
            | ErrorCode::TerminalFailure
            | ErrorCode::EventSinkError
            | ErrorCode::NetworkError => Self::Medium,

            ErrorCode::DuplicateRegistration
            | ErrorCode::InvalidRoutingRule
            | ErrorCode::InvalidSchedule
            | ErrorCode::QueueError
            | ErrorCode::ResultStoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::QueueUnavailable
            | ErrorCode::ResultStoreUnavailable
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, task type, queue)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.entity_id.is_none() && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Visionary Core.
#[derive(Error, Debug)]
pub struct VisionaryError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for VisionaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl VisionaryError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_infrastructure(&self) -> bool {
        self.code.is_infrastructure()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "visionary_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Human-readable message, mirrors `ApiResponse::error`
    pub error: String,

    /// Machine-readable error code
    pub error_code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&VisionaryError> for ErrorResponse {
    fn from(error: &VisionaryError) -> Self {
        Self {
            success: false,
            error: error.user_message.to_string(),
            error_code: error.code,
            numeric_code: error.code.numeric_code(),
            details: if error.details.is_empty() {
                None
            } else {
                Some(error.details.clone())
            },
            timestamp: chrono::Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for VisionaryError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| VisionaryError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| VisionaryError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| VisionaryError::internal(message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| VisionaryError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for VisionaryError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_io_error()
        {
            (ErrorCode::QueueUnavailable, "Unable to reach the broker")
        } else if error.is_timeout() {
            (ErrorCode::QueueUnavailable, "Broker operation timed out")
        } else {
            (ErrorCode::QueueError, "A broker error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for VisionaryError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<reqwest::Error> for VisionaryError {
    fn from(error: reqwest::Error) -> Self {
        let user_msg = if error.is_timeout() {
            "External request timed out"
        } else if error.is_connect() {
            "Failed to connect to external service"
        } else if error.is_status() {
            "External service returned an error"
        } else {
            "Network error occurred"
        };

        Self::with_internal(ErrorCode::NetworkError, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for VisionaryError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::TimeoutError, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for VisionaryError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::MissingConfiguration, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::TimeoutError, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for VisionaryError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<VisionaryError>() {
            Ok(err) => err,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for VisionaryError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl VisionaryError {
    /// A submission or lookup named a task type nobody registered.
    pub fn unknown_task_type(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self::new(
            ErrorCode::UnknownTaskType,
            format!("Unknown task type: {}", type_name),
        )
        .with_details(ErrorDetails::new().with_entity("task_type", type_name))
    }

    pub fn duplicate_registration(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self::new(
            ErrorCode::DuplicateRegistration,
            format!("Task type already registered: {}", type_name),
        )
        .with_details(ErrorDetails::new().with_entity("task_type", type_name))
    }

    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let job_id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id))
    }

    pub fn invalid_routing_rule(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidRoutingRule,
            format!("Invalid routing rule: {}", pattern.into()),
            reason,
        )
    }

    pub fn invalid_schedule(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        let entry = entry.into();
        Self::new(
            ErrorCode::InvalidSchedule,
            format!("Invalid schedule entry {}: {}", entry, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("schedule_entry", entry))
    }

    pub fn queue_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::QueueUnavailable, "Job broker is unavailable", message)
    }

    pub fn result_store_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ResultStoreUnavailable,
            "Result store is unavailable",
            message,
        )
    }

    /// Re-tag a broker error raised by the result store as a result store error.
    pub fn into_result_store_error(self) -> Self {
        let code = match self.code {
            ErrorCode::QueueUnavailable => ErrorCode::ResultStoreUnavailable,
            ErrorCode::QueueError => ErrorCode::ResultStoreError,
            other => other,
        };
        Self { code, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes_follow_categories() {
        assert_eq!(ErrorCode::UnknownTaskType.category(), "task");
        assert_eq!(ErrorCode::TimeoutError.category(), "execution");
        assert_eq!(ErrorCode::QueueUnavailable.category(), "broker");
        assert_eq!(ErrorCode::ResultStoreUnavailable.category(), "result_store");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(VisionaryError::unknown_task_type("x").http_status(), StatusCode::NOT_FOUND);
        assert_eq!(VisionaryError::job_not_found("abc").http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            VisionaryError::queue_unavailable("down").http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            VisionaryError::duplicate_registration("x").http_status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_infrastructure_errors_are_retryable() {
        assert!(ErrorCode::QueueUnavailable.is_retryable());
        assert!(ErrorCode::ResultStoreUnavailable.is_retryable());
        assert!(ErrorCode::QueueUnavailable.is_infrastructure());
        assert!(!ErrorCode::UnknownTaskType.is_retryable());
        assert!(!ErrorCode::TerminalFailure.is_retryable());
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = VisionaryError::queue_unavailable("connection refused");
        let text = err.to_string();
        assert!(text.contains("QUEUE_UNAVAILABLE"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_into_result_store_error() {
        let err = VisionaryError::queue_unavailable("gone").into_result_store_error();
        assert_eq!(err.code(), ErrorCode::ResultStoreUnavailable);
    }

    #[test]
    fn test_error_response_serializes_code() {
        let err = VisionaryError::unknown_task_type("tts.unknown");
        let body = serde_json::to_value(ErrorResponse::from(&err)).unwrap();
        assert_eq!(body["error_code"], "UNKNOWN_TASK_TYPE");
        assert_eq!(body["numeric_code"], 1000);
        assert_eq!(body["details"]["entity_id"], "tts.unknown");
    }

    #[test]
    fn test_result_context_keeps_source() {
        let err = serde_json::from_str::<u32>("not a number")
            .context("stored result is unreadable")
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.internal_message(), Some("stored result is unreadable"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let err = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }
}
