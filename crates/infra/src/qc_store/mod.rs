//! QC status store: the authoritative image-id → QC state mapping.
//!
//! ## Contract
//!
//! - Every write is applied (and, for durable stores, flushed) before the call
//!   returns, so the next read from any thread observes it.
//! - Status writes go through the QC state machine; illegal transitions are
//!   rejected, never silently applied.
//! - `compare_and_set_status` is the serialization point between the retry
//!   worker and manual approve/reject/delete on the same record.

pub mod file;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use qcretry_core::{ExecutionId, ImageId, ImageMetadata, ImageRecord, ProcessingSettings, QcStatus};

pub use file::JsonFileQcStore;
pub use memory::InMemoryQcStore;

/// Fields replaced on a successful retry. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub final_image_path: Option<PathBuf>,
    pub metadata: Option<ImageMetadata>,
    pub processing_settings: Option<ProcessingSettings>,
}

#[derive(Debug, thiserror::Error)]
pub enum QcStoreError {
    #[error("image not found: {0}")]
    NotFound(ImageId),
    #[error("image already exists: {0}")]
    AlreadyExists(ImageId),
    #[error("illegal qc status transition for {image_id}: {from} -> {to}")]
    IllegalTransition {
        image_id: ImageId,
        from: QcStatus,
        to: QcStatus,
    },
    #[error("qc status of {image_id} is {actual}, expected {expected}")]
    StatusMismatch {
        image_id: ImageId,
        expected: QcStatus,
        actual: QcStatus,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store io error: {0}")]
    Io(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl QcStoreError {
    /// Failures of the store itself rather than of the request.
    ///
    /// These abort a running retry job; request-level errors only affect the
    /// image concerned.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            QcStoreError::Unavailable(_) | QcStoreError::Io(_) | QcStoreError::Serialization(_)
        )
    }
}

/// Persistence contract for image QC state.
pub trait QcStatusStore: Send + Sync {
    fn get(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError>;

    /// Add a record produced by generation.
    fn insert(&self, record: ImageRecord) -> Result<(), QcStoreError>;

    /// Set status and reason (the reason is overwritten, `None` clears it).
    fn set_status(
        &self,
        image_id: &ImageId,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError>;

    /// Like `set_status`, but only if the current status is `expected`.
    fn compare_and_set_status(
        &self,
        image_id: &ImageId,
        expected: QcStatus,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError>;

    fn set_processing_result(
        &self,
        image_id: &ImageId,
        result: ProcessingResult,
    ) -> Result<(), QcStoreError>;

    fn list_by_status(&self, status: QcStatus) -> Result<Vec<ImageRecord>, QcStoreError>;

    fn list_by_execution(&self, execution_id: &ExecutionId) -> Result<Vec<ImageRecord>, QcStoreError>;

    /// External delete. Accepted from any status.
    fn remove(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError>;
}

impl<S> QcStatusStore for Arc<S>
where
    S: QcStatusStore + ?Sized,
{
    fn get(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        (**self).get(image_id)
    }

    fn insert(&self, record: ImageRecord) -> Result<(), QcStoreError> {
        (**self).insert(record)
    }

    fn set_status(
        &self,
        image_id: &ImageId,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        (**self).set_status(image_id, status, reason)
    }

    fn compare_and_set_status(
        &self,
        image_id: &ImageId,
        expected: QcStatus,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        (**self).compare_and_set_status(image_id, expected, status, reason)
    }

    fn set_processing_result(
        &self,
        image_id: &ImageId,
        result: ProcessingResult,
    ) -> Result<(), QcStoreError> {
        (**self).set_processing_result(image_id, result)
    }

    fn list_by_status(&self, status: QcStatus) -> Result<Vec<ImageRecord>, QcStoreError> {
        (**self).list_by_status(status)
    }

    fn list_by_execution(&self, execution_id: &ExecutionId) -> Result<Vec<ImageRecord>, QcStoreError> {
        (**self).list_by_execution(execution_id)
    }

    fn remove(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        (**self).remove(image_id)
    }
}

/// Apply a status write to a record in place, enforcing the state machine and
/// the optional expected-status guard.
pub(crate) fn apply_status(
    record: &mut ImageRecord,
    expected: Option<QcStatus>,
    status: QcStatus,
    reason: Option<String>,
) -> Result<(), QcStoreError> {
    if let Some(expected) = expected {
        if record.qc_status != expected {
            return Err(QcStoreError::StatusMismatch {
                image_id: record.id.clone(),
                expected,
                actual: record.qc_status,
            });
        }
    }

    record.qc_status = record
        .qc_status
        .transition(status)
        .map_err(|_| QcStoreError::IllegalTransition {
            image_id: record.id.clone(),
            from: record.qc_status,
            to: status,
        })?;
    record.qc_reason = reason;
    record.updated_at = Utc::now();
    Ok(())
}

pub(crate) fn apply_result(record: &mut ImageRecord, result: ProcessingResult) {
    if let Some(path) = result.final_image_path {
        record.final_image_path = Some(path);
    }
    if let Some(metadata) = result.metadata {
        record.metadata = Some(metadata);
    }
    if let Some(settings) = result.processing_settings {
        record.processing_settings = settings;
    }
    record.updated_at = Utc::now();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_mismatch_leaves_record_untouched() {
        let mut record = ImageRecord::qc_failed("a", "exec", "blurry");
        let err = apply_status(
            &mut record,
            Some(QcStatus::RetryPending),
            QcStatus::Processing,
            None,
        )
        .unwrap_err();

        assert!(matches!(err, QcStoreError::StatusMismatch { actual: QcStatus::QcFailed, .. }));
        assert_eq!(record.qc_status, QcStatus::QcFailed);
        assert_eq!(record.qc_reason.as_deref(), Some("blurry"));
    }

    #[test]
    fn status_write_overwrites_reason() {
        let mut record = ImageRecord::qc_failed("a", "exec", "blurry");
        apply_status(&mut record, None, QcStatus::RetryPending, None).unwrap();
        assert_eq!(record.qc_status, QcStatus::RetryPending);
        assert!(record.qc_reason.is_none());
    }

    #[test]
    fn result_only_replaces_present_fields() {
        let mut record = ImageRecord::qc_failed("a", "exec", "blurry").with_temp_path("/tmp/a.png");
        record.metadata = Some(ImageMetadata {
            title: "old".into(),
            ..Default::default()
        });

        apply_result(
            &mut record,
            ProcessingResult {
                final_image_path: Some("/out/a.png".into()),
                ..Default::default()
            },
        );

        assert_eq!(record.final_image_path, Some(PathBuf::from("/out/a.png")));
        assert_eq!(record.metadata.as_ref().map(|m| m.title.as_str()), Some("old"));
    }
}
