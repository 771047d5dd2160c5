//! Standardized error handling for the pipeline API
//!
//! Every handler error is rendered as an `ApiError` JSON body with a stable
//! error code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::automation::AutomationError;
use crate::pipeline::{PipelineError, RegistryError};
use crate::store::StoreError;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND", "INVALID_TRANSITION")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    // Resource errors
    NotFound(String),
    Conflict(String),

    // Pipeline rules
    InvalidTransition(String),
    ApprovalRequired(String),

    // Validation errors
    ValidationError { details: HashMap<String, Vec<String>> },
    BadRequest(String),

    // Server errors
    InternalError(String),
    DatabaseError(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::ApprovalRequired(_) => StatusCode::FORBIDDEN,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::ApprovalRequired(_) => "APPROVAL_REQUIRED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::Conflict(msg)
            | Self::InvalidTransition(msg)
            | Self::ApprovalRequired(msg)
            | Self::BadRequest(msg) => msg.clone(),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
        }
    }

    /// Create a validation error with a single field error
    pub fn validation_single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert(field.into(), vec![message.into()]);
        Self::ValidationError { details }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details } = self {
            error.details = Some(details);
        }

        (status, Json(error)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::DatabaseError(other.to_string()),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::RecordNotFound(lead_id) => Self::NotFound(format!("Pipeline record for lead {}", lead_id)),
            e @ PipelineError::InvalidTransition { .. } => Self::InvalidTransition(e.to_string()),
            e @ PipelineError::ApprovalRequired { .. } => Self::ApprovalRequired(e.to_string()),
            PipelineError::Registry(e @ RegistryError::UnknownStage(_)) => Self::BadRequest(e.to_string()),
            PipelineError::Registry(e) => Self::InternalError(e.to_string()),
            PipelineError::Persistence(e) => e.into(),
        }
    }
}

impl From<AutomationError> for AppError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::Validation(e) => {
                let mut details = HashMap::new();
                details.insert("rule".to_string(), e.problems);
                Self::ValidationError { details }
            }
            AutomationError::RuleNotFound(id) => Self::NotFound(format!("Rule {}", id)),
            AutomationError::ExecutionNotFound(id) => Self::NotFound(format!("Execution {}", id)),
            e @ AutomationError::NotCancellable { .. } => Self::Conflict(e.to_string()),
            e @ AutomationError::NotManual(_) => Self::BadRequest(e.to_string()),
            AutomationError::Queue(e) => Self::InternalError(e.to_string()),
            AutomationError::Store(e) => e.into(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = errors
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages = errors
                    .iter()
                    .map(|e| match &e.message {
                        Some(message) => message.to_string(),
                        None => e.code.to_string(),
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();
        Self::ValidationError { details }
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;
