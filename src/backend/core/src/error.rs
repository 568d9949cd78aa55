//! Error handling for the run manager.
//!
//! This module provides:
//! - A single error type with machine-readable codes and chaining
//! - User-facing messages kept apart from internal detail
//! - Severity-driven logging through `tracing`
//! - An error counter through the `metrics` facade
//!
//! Job failures are *not* represented here. A job that fails at execution
//! time records a [`crate::jobs::JobError`] on its row; `RunError` is for
//! failures of the API call itself (bad construction input, store trouble,
//! unknown ids).
//!
//! # Usage
//!
//! ```rust,ignore
//! use runmanager_core::error::{RunError, Result, ErrorContext};
//!
//! fn read_spec(path: &Path) -> Result<String> {
//!     std::fs::read_to_string(path).context("Failed to read workflow spec")
//! }
//! ```

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

/// A specialized Result type for run manager operations.
pub type Result<T> = std::result::Result<T, RunError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// Stable across releases so callers can match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Construction Errors (1000-1099)
    UnknownJobType,
    InvalidParameter,
    MissingParameter,
    DuplicateTag,
    TagNotFound,
    EmptyWorkflow,
    InvalidSplitCount,
    CycleDetected,

    // Scheduler Errors (1100-1199)
    JobNotFound,
    JobAlreadyExists,
    InvalidStateTransition,
    WorkflowNotFound,
    SchedulerShutDown,

    // Store Errors (2000-2099)
    StoreError,
    StoreConnectionFailed,
    StoreQueryFailed,
    MigrationFailed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    IoError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Construction Errors
            Self::UnknownJobType => 1000,
            Self::InvalidParameter => 1001,
            Self::MissingParameter => 1002,
            Self::DuplicateTag => 1003,
            Self::TagNotFound => 1004,
            Self::EmptyWorkflow => 1005,
            Self::InvalidSplitCount => 1006,
            Self::CycleDetected => 1007,

            // Scheduler Errors
            Self::JobNotFound => 1100,
            Self::JobAlreadyExists => 1101,
            Self::InvalidStateTransition => 1102,
            Self::WorkflowNotFound => 1103,
            Self::SchedulerShutDown => 1104,

            // Store Errors
            Self::StoreError => 2000,
            Self::StoreConnectionFailed => 2001,
            Self::StoreQueryFailed => 2002,
            Self::MigrationFailed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            // Serialization Errors
            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            // Configuration Errors
            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            // Internal Errors
            Self::InternalError => 9000,
            Self::IoError => 9001,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreConnectionFailed | Self::StoreQueryFailed | Self::IoError
        )
    }

    /// True for errors raised while building jobs or workflows.
    pub const fn is_construction(&self) -> bool {
        matches!(self.numeric_code(), 1000..=1099)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "construction",
            1100..=1199 => "scheduler",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (conflicting requests, shutdown, file access)
    Medium,
    /// System errors (store failures, bad configuration)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownJobType
            | ErrorCode::InvalidParameter
            | ErrorCode::MissingParameter
            | ErrorCode::DuplicateTag
            | ErrorCode::TagNotFound
            | ErrorCode::EmptyWorkflow
            | ErrorCode::InvalidSplitCount
            | ErrorCode::CycleDetected
            | ErrorCode::JobNotFound
            | ErrorCode::JobAlreadyExists
            | ErrorCode::WorkflowNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord => Self::Low,

            ErrorCode::InvalidStateTransition
            | ErrorCode::SchedulerShutDown
            | ErrorCode::IoError => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::StoreQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreConnectionFailed
            | ErrorCode::MigrationFailed
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

    /// Related entity ID (job, workflow, tag)
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
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the run manager.
#[derive(Error, Debug)]
pub struct RunError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to show to the caller
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl RunError {
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

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
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

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
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

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
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

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
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
            crate::telemetry::metrics::ERRORS_TOTAL,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| RunError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| RunError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RunError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| RunError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for RunError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        db_err.message().to_string(),
                    )
                    .with_source(error);
                }
                (ErrorCode::StoreQueryFailed, "A job store error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::StoreConnectionFailed,
                "Unable to reach the job store",
            ),
            _ => (ErrorCode::StoreError, "A job store error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for RunError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::MigrationFailed,
            "Failed to migrate the job store schema",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<serde_json::Error> for RunError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_data() || error.is_syntax() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "Failed to encode or decode stored data", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for RunError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            _ => (ErrorCode::IoError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for RunError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<RunError>() {
            Ok(run_error) => run_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for RunError {
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

impl RunError {
    // ─────────────────────────────────────────────────────────────────────────
    // Construction Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn unknown_job_type(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::UnknownJobType, format!("Unknown job type: {}", name))
            .with_details(ErrorDetails::new().with_entity("job_type", name))
    }

    pub fn invalid_parameter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(
            ErrorCode::InvalidParameter,
            format!("Invalid parameter '{}': {}", key, reason.into()),
        )
        .with_context("parameter", key)
    }

    pub fn missing_parameter(job_type: impl fmt::Display, key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(
            ErrorCode::MissingParameter,
            format!("{} job requires parameter '{}'", job_type, key),
        )
        .with_context("parameter", key)
    }

    pub fn duplicate_tag(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self::new(ErrorCode::DuplicateTag, format!("Workflow tag already in use: {}", tag))
            .with_details(ErrorDetails::new().with_entity("tag", tag))
    }

    pub fn tag_not_found(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self::new(ErrorCode::TagNotFound, format!("Workflow tag not found: {}", tag))
            .with_details(ErrorDetails::new().with_entity("tag", tag))
    }

    pub fn cycle_detected(details: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::CycleDetected,
            format!("Cycle detected in job tree: {}", details.into()),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduler Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn job_not_found(job_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    pub fn job_already_exists(job_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::JobAlreadyExists, format!("Job already exists: {}", job_id))
            .with_details(ErrorDetails::new().with_entity("job", job_id.to_string()))
    }

    pub fn invalid_state_transition(
        from: &crate::jobs::JobState,
        to: &crate::jobs::JobState,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition: {} -> {}", from, to),
        )
        .with_context("from_state", from.as_str())
        .with_context("to_state", to.as_str())
    }

    pub fn workflow_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::WorkflowNotFound, format!("Workflow not found: {}", name))
            .with_details(ErrorDetails::new().with_entity("workflow", name))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
