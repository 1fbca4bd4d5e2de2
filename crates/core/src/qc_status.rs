//! QC status lifecycle of a generated image.
//!
//! Legal transitions:
//!
//! - `qc_failed -> retry_pending` when the image is added to a retry batch
//! - `retry_pending -> processing` when the worker picks the image up
//! - `processing -> approved | retry_failed` when the retry resolves
//! - `processing -> retry_pending` when an aborted job hands its in-flight image back
//! - `retry_failed -> retry_pending` on resubmission
//! - `qc_failed | retry_failed -> approved` on manual approve
//! - `qc_failed | retry_failed | retry_pending -> qc_failed` on manual reject
//!
//! `approved` is terminal.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    QcFailed,
    RetryPending,
    Processing,
    RetryFailed,
    Approved,
}

impl QcStatus {
    pub const ALL: [QcStatus; 5] = [
        QcStatus::QcFailed,
        QcStatus::RetryPending,
        QcStatus::Processing,
        QcStatus::RetryFailed,
        QcStatus::Approved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QcStatus::QcFailed => "qc_failed",
            QcStatus::RetryPending => "retry_pending",
            QcStatus::Processing => "processing",
            QcStatus::RetryFailed => "retry_failed",
            QcStatus::Approved => "approved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QcStatus::Approved)
    }

    /// Statuses an image may be in when it is added to a retry batch.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(
            self,
            QcStatus::QcFailed | QcStatus::RetryFailed | QcStatus::RetryPending
        )
    }

    /// Statuses from which a manual approve is accepted.
    pub fn is_manually_approvable(&self) -> bool {
        matches!(self, QcStatus::QcFailed | QcStatus::RetryFailed)
    }

    pub fn can_transition_to(&self, to: QcStatus) -> bool {
        use QcStatus::*;

        matches!(
            (self, to),
            (QcFailed, RetryPending)
                | (RetryPending, Processing)
                | (Processing, Approved)
                | (Processing, RetryFailed)
                | (Processing, RetryPending)
                | (RetryFailed, RetryPending)
                | (QcFailed, Approved)
                | (RetryFailed, Approved)
                | (QcFailed, QcFailed)
                | (RetryFailed, QcFailed)
                | (RetryPending, QcFailed)
        )
    }

    /// Validate a transition, returning the target status on success.
    pub fn transition(self, to: QcStatus) -> DomainResult<QcStatus> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(DomainError::illegal_transition(self, to))
        }
    }
}

impl core::fmt::Display for QcStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for QcStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QcStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown qc status: {s}")))
    }
}
