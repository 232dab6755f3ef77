//! Error types for the stack operator.
//!
//! This module provides the error hierarchy for every stage of a stack's
//! lifecycle: configuration, resource persistence, remote provisioning and
//! reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the stack operator.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource store errors.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote provisioning API errors.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A resource locator could not be parsed.
    #[error("Invalid resource locator '{value}', expected <namespace>/<name>")]
    InvalidLocator {
        /// The rejected input.
        value: String,
    },
}

/// Resource store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resource does not exist.
    #[error("Stack resource not found: {locator}")]
    NotFound {
        /// Locator of the missing resource.
        locator: String,
    },

    /// A resource with the same locator already exists.
    #[error("Stack resource already exists: {locator}")]
    AlreadyExists {
        /// Locator of the existing resource.
        locator: String,
    },

    /// A stored document is unreadable.
    #[error("Stored resource is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("Resource serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Filesystem failure in the store backend.
    #[error("Store IO error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },
}

/// Remote provisioning API errors.
///
/// The sentinel conditions reported by the remote API as free text are
/// classified into explicit variants at the client boundary.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The remote stack does not exist.
    #[error("Stack does not exist: {stack}")]
    StackNotFound {
        /// Stack name or identifier that was looked up.
        stack: String,
    },

    /// An update was submitted but the stack already matches it.
    #[error("No updates are to be performed on stack {stack}")]
    NoUpdates {
        /// Stack name or identifier.
        stack: String,
    },

    /// API request failed.
    #[error("Provisioning API request failed: {code} - {message}")]
    ApiRequestFailed {
        /// Error code reported by the API.
        code: String,
        /// Error message from the API.
        message: String,
    },

    /// Request was throttled.
    #[error("Provisioning API throttled the request: {message}")]
    Throttled {
        /// Error message from the API.
        message: String,
    },

    /// Network error.
    #[error("Network error communicating with the provisioning API: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response from the provisioning API: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("Timed out after {secs}s during {operation}")]
    Timeout {
        /// Operation that was running.
        operation: &'static str,
        /// Deadline in seconds.
        secs: u64,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The resource sets neither or both of template and template URL.
    #[error("Stack resource {resource}: exactly one of template or templateUrl must be provided")]
    MissingTemplateSpec {
        /// Locator of the offending resource.
        resource: String,
    },
}

/// Result type alias for operator operations.
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if the stored resource does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }

    /// Returns true if the remote stack does not exist.
    #[must_use]
    pub const fn is_stack_not_found(&self) -> bool {
        matches!(self, Self::Provision(ProvisionError::StackNotFound { .. }))
    }

    /// Returns true if the remote API reported there was nothing to update.
    #[must_use]
    pub const fn is_no_updates(&self) -> bool {
        matches!(self, Self::Provision(ProvisionError::NoUpdates { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provision(
                ProvisionError::Throttled { .. }
                    | ProvisionError::NetworkError { .. }
                    | ProvisionError::Timeout { .. }
                    | ProvisionError::ApiRequestFailed { .. }
            ) | Self::Store(StoreError::Io { .. })
        )
    }

    /// Returns the suggested retry delay in seconds.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> u64 {
        match self {
            Self::Provision(ProvisionError::Throttled { .. }) => 10,
            Self::Reconcile(ReconcileError::MissingTemplateSpec { .. }) => 60,
            _ => 5,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StoreError {
    /// Creates a not-found error for the given locator.
    #[must_use]
    pub fn not_found(locator: impl ToString) -> Self {
        Self::NotFound {
            locator: locator.to_string(),
        }
    }

    /// Creates an IO error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }
}

impl ProvisionError {
    /// Creates an API request error.
    #[must_use]
    pub fn api_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}
