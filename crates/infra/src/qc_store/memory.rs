//! In-memory QC status store for tests/dev.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use qcretry_core::{ExecutionId, ImageId, ImageRecord, QcStatus};

use super::{apply_result, apply_status, ProcessingResult, QcStatusStore, QcStoreError};

#[derive(Debug, Default)]
pub struct InMemoryQcStore {
    images: RwLock<BTreeMap<ImageId, ImageRecord>>,
}

impl InMemoryQcStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a store with records (later duplicates replace earlier ones).
    pub fn with_records(records: impl IntoIterator<Item = ImageRecord>) -> Self {
        let images = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self {
            images: RwLock::new(images),
        }
    }

    pub fn len(&self) -> usize {
        self.images.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_record<T>(
        &self,
        image_id: &ImageId,
        f: impl FnOnce(&mut ImageRecord) -> Result<T, QcStoreError>,
    ) -> Result<T, QcStoreError> {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        let record = images
            .get_mut(image_id)
            .ok_or_else(|| QcStoreError::NotFound(image_id.clone()))?;
        f(record)
    }
}

fn poisoned() -> QcStoreError {
    QcStoreError::Unavailable("qc store lock poisoned".to_string())
}

impl QcStatusStore for InMemoryQcStore {
    fn get(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        let images = self.images.read().map_err(|_| poisoned())?;
        images
            .get(image_id)
            .cloned()
            .ok_or_else(|| QcStoreError::NotFound(image_id.clone()))
    }

    fn insert(&self, record: ImageRecord) -> Result<(), QcStoreError> {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        if images.contains_key(&record.id) {
            return Err(QcStoreError::AlreadyExists(record.id));
        }
        images.insert(record.id.clone(), record);
        Ok(())
    }

    fn set_status(
        &self,
        image_id: &ImageId,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        self.write_record(image_id, |r| apply_status(r, None, status, reason))
    }

    fn compare_and_set_status(
        &self,
        image_id: &ImageId,
        expected: QcStatus,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        self.write_record(image_id, |r| apply_status(r, Some(expected), status, reason))
    }

    fn set_processing_result(
        &self,
        image_id: &ImageId,
        result: ProcessingResult,
    ) -> Result<(), QcStoreError> {
        self.write_record(image_id, |r| {
            apply_result(r, result);
            Ok(())
        })
    }

    fn list_by_status(&self, status: QcStatus) -> Result<Vec<ImageRecord>, QcStoreError> {
        let images = self.images.read().map_err(|_| poisoned())?;
        Ok(images
            .values()
            .filter(|r| r.qc_status == status)
            .cloned()
            .collect())
    }

    fn list_by_execution(&self, execution_id: &ExecutionId) -> Result<Vec<ImageRecord>, QcStoreError> {
        let images = self.images.read().map_err(|_| poisoned())?;
        Ok(images
            .values()
            .filter(|r| &r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    fn remove(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        images
            .remove(image_id)
            .ok_or_else(|| QcStoreError::NotFound(image_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryQcStore {
        InMemoryQcStore::with_records([
            ImageRecord::qc_failed("a", "exec-1", "blurry"),
            ImageRecord::qc_failed("b", "exec-1", "cropped"),
            ImageRecord::qc_failed("c", "exec-2", "text artifacts"),
        ])
    }

    #[test]
    fn writes_are_visible_to_the_next_read() {
        let store = store();
        let id = ImageId::from("a");

        store.set_status(&id, QcStatus::RetryPending, None).unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.qc_status, QcStatus::RetryPending);
        assert!(record.qc_reason.is_none());
        assert_eq!(store.list_by_status(QcStatus::QcFailed).unwrap().len(), 2);
    }

    #[test]
    fn approved_is_terminal() {
        let store = store();
        let id = ImageId::from("a");
        store.set_status(&id, QcStatus::Approved, None).unwrap();

        let err = store.set_status(&id, QcStatus::RetryPending, None).unwrap_err();
        assert!(matches!(
            err,
            QcStoreError::IllegalTransition {
                from: QcStatus::Approved,
                to: QcStatus::RetryPending,
                ..
            }
        ));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let store = store();
        let id = ImageId::from("missing");
        assert!(matches!(store.get(&id), Err(QcStoreError::NotFound(_))));
        assert!(matches!(
            store.set_status(&id, QcStatus::RetryPending, None),
            Err(QcStoreError::NotFound(_))
        ));
    }

    #[test]
    fn remove_is_accepted_from_any_status() {
        let store = store();
        let id = ImageId::from("b");
        store.set_status(&id, QcStatus::RetryPending, None).unwrap();
        store.set_status(&id, QcStatus::Processing, None).unwrap();

        let removed = store.remove(&id).unwrap();
        assert_eq!(removed.qc_status, QcStatus::Processing);
        assert!(matches!(store.get(&id), Err(QcStoreError::NotFound(_))));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = store();
        let err = store
            .insert(ImageRecord::qc_failed("a", "exec-9", "dup"))
            .unwrap_err();
        assert!(matches!(err, QcStoreError::AlreadyExists(_)));
    }

    #[test]
    fn list_by_execution_groups_records() {
        let store = store();
        let ids: Vec<_> = store
            .list_by_execution(&ExecutionId::from("exec-1"))
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
