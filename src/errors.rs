//! # Repository Errors
//!
//! Error taxonomy shared by the query facade, the live pipeline and the
//! backend boundary.
//!
//! - Validation failures surface when a query is built, never at evaluation.
//! - Evaluation failures come back from compiled expressions unchanged.
//! - Concurrent modification is returned to the writer, never retried.
//! - Transient backend failures only affect live subscriptions and are
//!   retried by the statement multiplexer up to its bound.
//! - A reference that no longer resolves is an absent value, not an error.

use thiserror::Error;

use crate::expression::ExpressionError;

/// Result type for repository operations
pub type RepoResult<T> = Result<T, RepoError>;

/// Repository errors
///
/// `Clone` so that one failure of a shared live statement can be delivered
/// to every attached subscriber.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepoError {
    // ==================
    // Build-time Errors
    // ==================
    /// Malformed expression, composition or property path
    #[error("Validation error: {0}")]
    Validation(ExpressionError),

    /// Entity type not registered in the schema registry
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    // ==================
    // Evaluation Errors
    // ==================
    /// A compiled expression failed while evaluating an instance
    #[error("Evaluation error: {0}")]
    Evaluation(ExpressionError),

    // ==================
    // Backend Errors
    // ==================
    /// The backend rejected a write because of a conflicting update
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Recoverable backend failure (live subscriptions retry these)
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// Non-recoverable backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    // ==================
    // Live Errors
    // ==================
    /// A shared live statement gave up after its retry bound
    #[error("Live statement failed after {attempts} retries: {last_error}")]
    RetriesExhausted {
        /// Number of resubscribe attempts made
        attempts: u32,
        /// Message of the last transient error
        last_error: String,
    },

    /// The producing side of a live stream went away
    #[error("Subscription closed")]
    SubscriptionClosed,

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RepoError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            RepoError::Validation(_) => "AERO_REPO_VALIDATION",
            RepoError::UnknownEntity(_) => "AERO_REPO_UNKNOWN_ENTITY",
            RepoError::Evaluation(_) => "AERO_REPO_EVALUATION",
            RepoError::ConcurrentModification(_) => "AERO_REPO_CONCURRENT_MODIFICATION",
            RepoError::TransientBackend(_) => "AERO_REPO_TRANSIENT_BACKEND",
            RepoError::Backend(_) => "AERO_REPO_BACKEND",
            RepoError::RetriesExhausted { .. } => "AERO_REPO_RETRIES_EXHAUSTED",
            RepoError::SubscriptionClosed => "AERO_REPO_SUBSCRIPTION_CLOSED",
            RepoError::Internal(_) => "AERO_REPO_INTERNAL",
            RepoError::Config(_) => "AERO_REPO_CONFIG",
        }
    }

    /// Returns true if a live subscription may retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::TransientBackend(_))
    }

    /// Returns true if this error was raised while building a query
    pub fn is_validation(&self) -> bool {
        matches!(self, RepoError::Validation(_) | RepoError::UnknownEntity(_))
    }

    /// Create a transient backend error
    pub fn transient(msg: impl Into<String>) -> Self {
        RepoError::TransientBackend(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        RepoError::Backend(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        RepoError::Internal(msg.into())
    }
}

impl From<ExpressionError> for RepoError {
    fn from(e: ExpressionError) -> Self {
        if e.is_validation() {
            RepoError::Validation(e)
        } else {
            RepoError::Evaluation(e)
        }
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Internal(format!("serialization failed: {}", e))
    }
}

impl From<tokio::task::JoinError> for RepoError {
    fn from(e: tokio::task::JoinError) -> Self {
        RepoError::Internal(format!("worker task failed: {}", e))
    }
}
