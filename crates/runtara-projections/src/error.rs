// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-projections.
//!
//! Provides a unified error type that maps to management reply codes.

use std::fmt;

/// Result type using ProjectionError
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Errors raised by the projection orchestration layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ProjectionError {
    /// No projection is registered under the given name.
    NotFound {
        /// The projection name that was not found.
        name: String,
    },

    /// A projection with the same name is already registered.
    Conflict {
        /// The duplicate projection name.
        name: String,
    },

    /// The command is not valid in the projection's current state.
    InvalidOperation {
        /// Why the command was rejected.
        reason: String,
    },

    /// The command could not be completed.
    OperationFailed {
        /// The reason for failure.
        reason: String,
    },

    /// The run-as principal is not allowed to perform the command.
    NotAuthorized,

    /// An internal consistency contract was violated.
    ///
    /// The message that triggered it is abandoned; the projection is left
    /// in whatever state the failing step reached.
    Fatal {
        /// Description of the violated contract.
        reason: String,
    },

    /// A control-stream entry could not be understood.
    Protocol {
        /// Description of the protocol violation.
        reason: String,
    },

    /// The event log backend failed.
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The target actor is not running or dropped the request.
    Unavailable {
        /// What was unavailable.
        reason: String,
    },
}

impl ProjectionError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::OperationFailed { .. } => "OPERATION_FAILED",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::Fatal { .. } => "INTERNAL_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Unavailable { .. } => "UNAVAILABLE",
        }
    }

    /// Shorthand for a [`ProjectionError::Fatal`].
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ProjectionError::InvalidOperation`].
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Whether this error terminates processing of the current message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Protocol { .. })
    }
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "Projection '{}' not found", name),
            Self::Conflict { name } => write!(f, "Duplicate projection name: {}", name),
            Self::InvalidOperation { reason } => write!(f, "{}", reason),
            Self::OperationFailed { reason } => write!(f, "{}", reason),
            Self::NotAuthorized => write!(f, "Not authorized"),
            Self::Fatal { reason } => write!(f, "Internal error: {}", reason),
            Self::Protocol { reason } => write!(f, "Protocol error: {}", reason),
            Self::Storage { operation, details } => {
                write!(f, "Storage error during '{}': {}", operation, details)
            }
            Self::Unavailable { reason } => write!(f, "Unavailable: {}", reason),
        }
    }
}

impl std::error::Error for ProjectionError {}

impl From<sqlx::Error> for ProjectionError {
    fn from(err: sqlx::Error) -> Self {
        ProjectionError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProjectionError {
    fn from(err: serde_json::Error) -> Self {
        ProjectionError::Protocol {
            reason: format!("invalid json body: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                ProjectionError::NotFound {
                    name: "orders".to_string(),
                },
                "NOT_FOUND",
            ),
            (
                ProjectionError::Conflict {
                    name: "orders".to_string(),
                },
                "CONFLICT",
            ),
            (
                ProjectionError::invalid_operation("Cannot stop a projection in the 'Creating' state"),
                "INVALID_OPERATION",
            ),
            (
                ProjectionError::OperationFailed {
                    reason: "Aborted by subsequent operation".to_string(),
                },
                "OPERATION_FAILED",
            ),
            (ProjectionError::NotAuthorized, "NOT_AUTHORIZED"),
            (
                ProjectionError::fatal("Projection version and event number mismatch"),
                "INTERNAL_ERROR",
            ),
            (
                ProjectionError::Protocol {
                    reason: "Unknown response: $bogus".to_string(),
                },
                "PROTOCOL_ERROR",
            ),
            (
                ProjectionError::Storage {
                    operation: "append".to_string(),
                    details: "disk full".to_string(),
                },
                "STORAGE_ERROR",
            ),
            (
                ProjectionError::Unavailable {
                    reason: "manager stopped".to_string(),
                },
                "UNAVAILABLE",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_error_display() {
        let err = ProjectionError::Conflict {
            name: "orders".to_string(),
        };
        assert_eq!(err.to_string(), "Duplicate projection name: orders");

        let err = ProjectionError::invalid_operation(
            "Cannot delete a projection that hasn't been stopped or faulted.",
        );
        assert_eq!(
            err.to_string(),
            "Cannot delete a projection that hasn't been stopped or faulted."
        );

        let err = ProjectionError::Storage {
            operation: "append".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Storage error during 'append': connection refused"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProjectionError::fatal("x").is_fatal());
        assert!(
            ProjectionError::Protocol {
                reason: "x".to_string()
            }
            .is_fatal()
        );
        assert!(!ProjectionError::NotAuthorized.is_fatal());
        assert!(!ProjectionError::invalid_operation("x").is_fatal());
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err: ProjectionError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "PROTOCOL_ERROR");
    }
}
