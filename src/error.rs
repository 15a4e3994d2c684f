//! Crate-wide error taxonomy.
//!
//! Covers `ValidationError`, `NotFound`, `Gone`, `PreconditionFailed`,
//! `ConflictTransient`, `UnavailableDownstream`, and `InternalError`.
//! The core never maps these to HTTP status codes itself —
//! that is the REST surface's job — but each variant documents the status
//! class a caller is expected to use.

use thiserror::Error;

use crate::gateway::GatewayError;

/// Why a resource or pagination token is `Gone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    /// A tombstone exists for this `Type/id`.
    Tombstoned,
    /// The pagination token has expired or is unknown.
    PaginationExpired,
}

/// Errors surfaced by the resource orchestration engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown resource type, unsupported search parameter, or malformed value. 400/422-class.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Live read of an absent resource with no tombstone. 404-class.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// Tombstoned resource or expired pagination token. 410-class.
    #[error("resource gone: {resource_type}/{id}")]
    Gone {
        resource_type: String,
        id: String,
        reason: GoneReason,
    },

    /// Conditional operation matched more than one resource, or an If-Match
    /// precondition did not hold. 412-class.
    #[error("precondition failed on {resource_type}?{criteria}")]
    PreconditionFailed {
        resource_type: String,
        criteria: String,
    },

    /// Transactional contention that the gateway's retry budget could not
    /// resolve. 409-class after exhaustion.
    #[error("transient conflict after {attempts} attempt(s): {message}")]
    ConflictTransient { message: String, attempts: u32 },

    /// Circuit-breaker open, timeout, or connection loss in the gateway. 503-class.
    #[error("downstream unavailable: {message}")]
    UnavailableDownstream { message: String },

    /// Invariant violation or unexpected condition. 500-class.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn gone(resource_type: impl Into<String>, id: impl Into<String>, reason: GoneReason) -> Self {
        Self::Gone {
            resource_type: resource_type.into(),
            id: id.into(),
            reason,
        }
    }

    pub fn precondition_failed(
        resource_type: impl Into<String>,
        criteria: impl Into<String>,
    ) -> Self {
        Self::PreconditionFailed {
            resource_type: resource_type.into(),
            criteria: criteria.into(),
        }
    }

    pub fn conflict_transient(message: impl Into<String>, attempts: u32) -> Self {
        Self::ConflictTransient {
            message: message.into(),
            attempts,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::UnavailableDownstream {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<GatewayError> for CoreError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Timeout(_) | GatewayError::CircuitOpen(_) | GatewayError::Connection(_) => {
                CoreError::unavailable(err.to_string())
            }
            GatewayError::Transient(message) => CoreError::conflict_transient(message, 1),
            GatewayError::Query(message) => CoreError::internal(message),
            GatewayError::NotFound => CoreError::internal("gateway reported NotFound outside an Option-returning call"),
        }
    }
}
