//! Error types for the campus escrow orchestrator
//!
//! This module defines all error types that can occur while driving a
//! purchase through its lifecycle. Every variant maps onto one caller-facing
//! [`ErrorCode`].
//!
//! # Error Categories
//!
//! - **Business-state facts**: conflicts, guard violations, missing entities,
//!   rate limits and duplicate ratings. Always surfaced verbatim.
//! - **Gateway errors**: failures reported by the payment processor.
//! - **Store contention**: optimistic-commit conflicts, retried internally.
//! - **Replay I/O errors**: file and CSV problems of the command-line tool.

use thiserror::Error;

/// Caller-facing classification of an [`EscrowError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Conflict,
    PreconditionFailed,
    PermissionDenied,
    NotFound,
    ResourceExhausted,
    AlreadyExists,
    InvalidArgument,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Conflict => "conflict",
            ErrorCode::PreconditionFailed => "failed-precondition",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::NotFound => "not-found",
            ErrorCode::ResourceExhausted => "resource-exhausted",
            ErrorCode::AlreadyExists => "already-exists",
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Main error type for the escrow orchestrator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EscrowError {
    /// The item is no longer available (another buyer reserved it first)
    #[error("Item {item} is no longer available")]
    Conflict {
        /// Item that could not be reserved
        item: String,
    },

    /// A guard was violated (wrong status, counterparty not payment-ready, ...)
    #[error("Cannot {operation}: {reason}")]
    PreconditionFailed {
        /// Operation that was attempted
        operation: String,
        /// Why the guard rejected it
        reason: String,
    },

    /// The caller is not a legitimate participant or operator
    #[error("User {user} is not allowed to {operation}")]
    PermissionDenied {
        /// Caller identity
        user: String,
        /// Operation that was attempted
        operation: String,
    },

    /// A referenced document does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Document kind (item, transaction, user, payment intent)
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Rate limit reached for this user and action
    #[error("Rate limit exceeded for {user} on {action}: {limit} per {window_secs}s")]
    ResourceExhausted {
        user: String,
        action: String,
        limit: u32,
        window_secs: u64,
    },

    /// The participant already rated this transaction
    #[error("Transaction {tx} was already rated by the {role}")]
    AlreadyExists {
        /// Transaction identifier
        tx: String,
        /// Role that already rated
        role: String,
    },

    /// Malformed input
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Webhook signature could not be verified
    #[error("Invalid webhook signature: {reason}")]
    InvalidSignature { reason: String },

    /// An optimistic commit lost a race; the caller re-reads and retries
    #[error("Concurrent modification of {document}")]
    Contention {
        /// Document whose precondition failed
        document: String,
    },

    /// The payment processor rejected or failed an operation
    #[error("Payment processor error during {operation}: {message}")]
    Gateway { operation: String, message: String },

    /// The payment intent is not in a state that allows the operation
    #[error("Payment intent {intent} is {status}, cannot {operation}")]
    GatewayInvalidState {
        intent: String,
        status: String,
        operation: String,
    },

    /// Unexpected failure
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Scenario file not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// I/O error while reading or writing files
    #[error("I/O error: {message}")]
    Io { message: String },

    /// CSV parsing error
    #[error("CSV parse error{}: {message}", line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
    Parse { line: Option<u64>, message: String },
}

impl From<std::io::Error> for EscrowError {
    fn from(error: std::io::Error) -> Self {
        EscrowError::Io {
            message: error.to_string(),
        }
    }
}

impl From<csv::Error> for EscrowError {
    fn from(error: csv::Error) -> Self {
        let line = error.position().map(|pos| pos.line());

        EscrowError::Parse {
            line,
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(error: serde_json::Error) -> Self {
        EscrowError::InvalidArgument {
            message: format!("malformed payload: {}", error),
        }
    }
}

impl EscrowError {
    /// Caller-facing classification of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EscrowError::Conflict { .. } => ErrorCode::Conflict,
            EscrowError::PreconditionFailed { .. } | EscrowError::GatewayInvalidState { .. } => {
                ErrorCode::PreconditionFailed
            }
            EscrowError::PermissionDenied { .. } | EscrowError::InvalidSignature { .. } => {
                ErrorCode::PermissionDenied
            }
            EscrowError::NotFound { .. } | EscrowError::FileNotFound { .. } => ErrorCode::NotFound,
            EscrowError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            EscrowError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            EscrowError::InvalidArgument { .. } | EscrowError::Parse { .. } => {
                ErrorCode::InvalidArgument
            }
            EscrowError::Contention { .. }
            | EscrowError::Gateway { .. }
            | EscrowError::Internal { .. }
            | EscrowError::Io { .. } => ErrorCode::Internal,
        }
    }
}

// Helper functions for creating common errors

impl EscrowError {
    /// Create a Conflict error
    pub fn conflict(item: &str) -> Self {
        EscrowError::Conflict {
            item: item.to_string(),
        }
    }

    /// Create a PreconditionFailed error
    pub fn precondition_failed(operation: &str, reason: impl Into<String>) -> Self {
        EscrowError::PreconditionFailed {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a PermissionDenied error
    pub fn permission_denied(user: &str, operation: &str) -> Self {
        EscrowError::PermissionDenied {
            user: user.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(kind: &str, id: &str) -> Self {
        EscrowError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Create a ResourceExhausted error
    pub fn resource_exhausted(user: &str, action: &str, limit: u32, window_secs: u64) -> Self {
        EscrowError::ResourceExhausted {
            user: user.to_string(),
            action: action.to_string(),
            limit,
            window_secs,
        }
    }

    /// Create an AlreadyExists error
    pub fn already_exists(tx: &str, role: &str) -> Self {
        EscrowError::AlreadyExists {
            tx: tx.to_string(),
            role: role.to_string(),
        }
    }

    /// Create an InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EscrowError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an InvalidSignature error
    pub fn invalid_signature(reason: impl Into<String>) -> Self {
        EscrowError::InvalidSignature {
            reason: reason.into(),
        }
    }

    /// Create a Contention error
    pub fn contention(document: impl Into<String>) -> Self {
        EscrowError::Contention {
            document: document.into(),
        }
    }

    /// Create a Gateway error
    pub fn gateway(operation: &str, message: impl Into<String>) -> Self {
        EscrowError::Gateway {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Create a GatewayInvalidState error
    pub fn gateway_invalid_state(intent: &str, status: &str, operation: &str) -> Self {
        EscrowError::GatewayInvalidState {
            intent: intent.to_string(),
            status: status.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        EscrowError::Internal {
            message: message.into(),
        }
    }
}
