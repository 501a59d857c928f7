//! Error types for the Erudite orchestrator.
//!
//! This module defines the error hierarchy for configuration loading,
//! document intake, session orchestration, model calls, and learning-state
//! persistence.

use std::path::PathBuf;

use erudite_model::{ModelError, ModelErrorKind};

/// A specialized `Result` type for Erudite orchestrator operations.
pub type Result<T> = std::result::Result<T, EruditeError>;

/// Message stored in the transcript when a model turn fails.
pub const TURN_FAILED_MESSAGE: &str = "Failed to get response from Erudite. Please try again.";

/// Errors that can occur while serving learners.
///
/// Variants are grouped by subsystem and include actionable suggestions
/// where the operator or learner can do something about them.
#[derive(Debug, thiserror::Error)]
pub enum EruditeError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your erudite.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the operator.
        suggestion: String,
    },

    /// The environment variable holding the model API key is unset or empty.
    #[error("Model API key not found in environment variable '{env_var}'\n\nSuggestion: Add {env_var}=your_key_here to the relay's environment")]
    MissingApiKey {
        /// Name of the environment variable that was checked.
        env_var: String,
    },

    // ========================================================================
    // Document Errors
    // ========================================================================
    /// Extracted document text exceeds the intake limit.
    #[error("Document exceeds size limit (2MB): '{file_name}' is {size_kb}KB\n\nSuggestion: Split the document into smaller parts")]
    DocumentTooLarge {
        /// Name of the oversized document.
        file_name: String,
        /// Actual size in kilobytes.
        size_kb: u64,
    },

    // ========================================================================
    // Input Validation Errors
    // ========================================================================
    /// A request field was missing or malformed.
    #[error("{message}")]
    InvalidInput {
        /// Name of the offending field.
        field: String,
        /// Human-readable description.
        message: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// No session exists with the given id.
    #[error("Session not found: '{id}'")]
    SessionNotFound {
        /// The requested session id.
        id: String,
    },

    /// The session already has a model call in flight.
    #[error("Session is waiting for a response; wait for it before sending another message")]
    SessionBusy,

    /// The task running a turn ended without recording an outcome.
    #[error("Turn was abandoned before the model answered")]
    TurnAbandoned,

    /// Invalid state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    // ========================================================================
    // Model Errors
    // ========================================================================
    /// The hosted model returned an error.
    #[error("Model API error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    ModelApiError {
        /// The kind of API error.
        kind: ModelErrorKind,
        /// Detailed error message.
        message: String,
        /// Actionable suggestion.
        suggestion: String,
    },

    /// The hosted model did not answer within the configured timeout.
    #[error("Model timeout after {timeout_secs}s\n\nSuggestion: Try again")]
    ModelTimeout {
        /// The timeout duration in seconds.
        timeout_secs: u64,
    },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// Reading or writing learning state failed.
    #[error("Persistence failed during {operation}: {message}")]
    PersistenceFailed {
        /// What was being persisted.
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// A persisted record could not be decoded.
    #[error("Corrupted record '{path}': {message}\n\nSuggestion: Remove or restore the file")]
    RecordCorrupted {
        /// Path to the corrupted record.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ModelError> for EruditeError {
    fn from(err: ModelError) -> Self {
        Self::model_api_error(err.kind(), err.to_string())
    }
}

impl EruditeError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `MissingApiKey` error.
    #[must_use]
    pub fn missing_api_key(env_var: impl Into<String>) -> Self {
        Self::MissingApiKey {
            env_var: env_var.into(),
        }
    }

    /// Creates a new `DocumentTooLarge` error.
    #[must_use]
    pub fn document_too_large(file_name: impl Into<String>, size_kb: u64) -> Self {
        Self::DocumentTooLarge {
            file_name: file_name.into(),
            size_kb,
        }
    }

    /// Creates a new `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a new `SessionNotFound` error.
    #[must_use]
    pub fn session_not_found(id: impl std::fmt::Display) -> Self {
        Self::SessionNotFound { id: id.to_string() }
    }

    /// Creates a new `ModelApiError` with automatic suggestion based on error kind.
    #[must_use]
    pub fn model_api_error(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self::ModelApiError {
            kind,
            message: message.into(),
            suggestion: kind.suggestion().to_string(),
        }
    }

    /// Creates a new `ModelTimeout` error.
    #[must_use]
    pub const fn model_timeout(timeout_secs: u64) -> Self {
        Self::ModelTimeout { timeout_secs }
    }

    /// Creates a new `PersistenceFailed` error.
    #[must_use]
    pub fn persistence(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::PersistenceFailed {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Creates a new `RecordCorrupted` error.
    #[must_use]
    pub fn record_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::RecordCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns `true` if this error came from the hosted model.
    #[must_use]
    pub const fn is_model_failure(&self) -> bool {
        matches!(self, Self::ModelApiError { .. } | Self::ModelTimeout { .. })
    }

    /// A description that is safe to show to a learner.
    ///
    /// Provider details, paths and credentials never appear here.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::ModelTimeout { .. }
            | Self::ModelApiError {
                kind: ModelErrorKind::Timeout,
                ..
            } => "Erudite took too long to respond. Please try again.".to_string(),
            Self::ModelApiError {
                kind: ModelErrorKind::RateLimit,
                ..
            } => "Erudite is receiving too many requests. Please try again in a moment."
                .to_string(),
            Self::ModelApiError { .. } | Self::TurnAbandoned => TURN_FAILED_MESSAGE.to_string(),
            Self::InvalidInput { message, .. } => message.clone(),
            Self::DocumentTooLarge { .. } => {
                "This document is too large (limit 2 MB). Please split it into smaller parts."
                    .to_string()
            }
            Self::SessionBusy | Self::SessionNotFound { .. } => self.to_string(),
            Self::PersistenceFailed { .. } | Self::RecordCorrupted { .. } | Self::Io(_) => {
                "Your progress could not be saved. Please try again.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}
