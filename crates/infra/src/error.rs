//! Errors at the queue / service boundary.

use qcretry_core::{DomainError, RetryJobId};

use crate::jobs::store::RetryJobStoreError;
use crate::qc_store::QcStoreError;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// No eligible image ids remained after dedup and skipping.
    #[error("no eligible images in retry batch")]
    EmptyBatch,
    #[error("retry job not found: {0}")]
    JobNotFound(RetryJobId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] QcStoreError),
    #[error(transparent)]
    Jobs(#[from] RetryJobStoreError),
}

impl RetryError {
    /// True when the failure came from storage rather than the request.
    pub fn is_infrastructure(&self) -> bool {
        match self {
            RetryError::Store(e) => e.is_infrastructure(),
            RetryError::Jobs(_) => true,
            _ => false,
        }
    }
}

pub type RetryResult<T> = Result<T, RetryError>;
