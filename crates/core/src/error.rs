//! Domain error model.

use thiserror::Error;

use crate::qc_status::QcStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// state machine rules). Storage and I/O concerns belong to the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. out-of-range processing setting).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The QC state machine does not allow this transition.
    #[error("illegal qc status transition: {from} -> {to}")]
    IllegalTransition { from: QcStatus, to: QcStatus },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(from: QcStatus, to: QcStatus) -> Self {
        Self::IllegalTransition { from, to }
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
