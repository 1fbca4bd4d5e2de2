//! JSON-file backed QC status store.
//!
//! The whole store is one JSON document (`{"version":1,"images":[...]}`).
//! Every write is applied to a copy of the map, persisted through a temp file
//! plus rename, and only then committed in memory, so a failed write leaves
//! both the file and the in-memory view unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use qcretry_core::{ExecutionId, ImageId, ImageRecord, QcStatus};

use super::{apply_result, apply_status, ProcessingResult, QcStatusStore, QcStoreError};

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    images: Vec<ImageRecord>,
}

#[derive(Debug)]
pub struct JsonFileQcStore {
    path: PathBuf,
    images: RwLock<BTreeMap<ImageId, ImageRecord>>,
}

impl JsonFileQcStore {
    /// Open the store at `path`. A missing file is an empty store; the file is
    /// created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QcStoreError> {
        let path = path.into();
        let images = load(&path)?;
        info!(path = %path.display(), images = images.len(), "opened qc store");
        Ok(Self {
            path,
            images: RwLock::new(images),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, images: &BTreeMap<ImageId, ImageRecord>) -> Result<(), QcStoreError> {
        let document = StoreDocument {
            version: DOCUMENT_VERSION,
            images: images.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| QcStoreError::Serialization(e.to_string()))?;

        write_atomically(&self.path, &bytes).map_err(|e| QcStoreError::Io(format!("{e:#}")))?;
        debug!(path = %self.path.display(), images = images.len(), "persisted qc store");
        Ok(())
    }

    /// Apply `f` to a copy, persist it, then swap it in.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<ImageId, ImageRecord>) -> Result<T, QcStoreError>,
    ) -> Result<T, QcStoreError> {
        let mut images = self.images.write().map_err(|_| poisoned())?;
        let mut next = images.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *images = next;
        Ok(out)
    }

    fn mutate_record<T>(
        &self,
        image_id: &ImageId,
        f: impl FnOnce(&mut ImageRecord) -> Result<T, QcStoreError>,
    ) -> Result<T, QcStoreError> {
        self.mutate(|images| {
            let record = images
                .get_mut(image_id)
                .ok_or_else(|| QcStoreError::NotFound(image_id.clone()))?;
            f(record)
        })
    }
}

fn poisoned() -> QcStoreError {
    QcStoreError::Unavailable("qc store lock poisoned".to_string())
}

fn load(path: &Path) -> Result<BTreeMap<ImageId, ImageRecord>, QcStoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let bytes = fs::read(path)
        .with_context(|| format!("reading {}", path.display()))
        .map_err(|e| QcStoreError::Io(format!("{e:#}")))?;
    let document: StoreDocument = serde_json::from_slice(&bytes)
        .map_err(|e| QcStoreError::Serialization(format!("{}: {e}", path.display())))?;
    if document.version != DOCUMENT_VERSION {
        return Err(QcStoreError::Serialization(format!(
            "{}: unsupported document version {}",
            path.display(),
            document.version
        )));
    }
    Ok(document
        .images
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("writing {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

impl QcStatusStore for JsonFileQcStore {
    fn get(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        let images = self.images.read().map_err(|_| poisoned())?;
        images
            .get(image_id)
            .cloned()
            .ok_or_else(|| QcStoreError::NotFound(image_id.clone()))
    }

    fn insert(&self, record: ImageRecord) -> Result<(), QcStoreError> {
        self.mutate(|images| {
            if images.contains_key(&record.id) {
                return Err(QcStoreError::AlreadyExists(record.id));
            }
            images.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn set_status(
        &self,
        image_id: &ImageId,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        self.mutate_record(image_id, |r| apply_status(r, None, status, reason))
    }

    fn compare_and_set_status(
        &self,
        image_id: &ImageId,
        expected: QcStatus,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        self.mutate_record(image_id, |r| apply_status(r, Some(expected), status, reason))
    }

    fn set_processing_result(
        &self,
        image_id: &ImageId,
        result: ProcessingResult,
    ) -> Result<(), QcStoreError> {
        self.mutate_record(image_id, |r| {
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
        self.mutate(|images| {
            images
                .remove(image_id)
                .ok_or_else(|| QcStoreError::NotFound(image_id.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("qcretry-store-{}", uuid::Uuid::now_v7()))
            .join("images.json")
    }

    #[test]
    fn missing_file_opens_empty() {
        let store = JsonFileQcStore::open(temp_path()).unwrap();
        assert!(store.list_by_status(QcStatus::QcFailed).unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn writes_survive_reopen() {
        let path = temp_path();
        {
            let store = JsonFileQcStore::open(&path).unwrap();
            store
                .insert(ImageRecord::qc_failed("a", "exec-1", "blurry"))
                .unwrap();
            store
                .set_status(&ImageId::from("a"), QcStatus::RetryPending, None)
                .unwrap();
        }

        let reopened = JsonFileQcStore::open(&path).unwrap();
        let record = reopened.get(&ImageId::from("a")).unwrap();
        assert_eq!(record.qc_status, QcStatus::RetryPending);
        assert!(record.qc_reason.is_none());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn rejected_write_leaves_file_unchanged() {
        let path = temp_path();
        let store = JsonFileQcStore::open(&path).unwrap();
        store
            .insert(ImageRecord::qc_failed("a", "exec-1", "blurry"))
            .unwrap();
        let before = fs::read(&path).unwrap();

        let err = store
            .set_status(&ImageId::from("a"), QcStatus::Processing, None)
            .unwrap_err();
        assert!(matches!(err, QcStoreError::IllegalTransition { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_document_is_a_serialization_error() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();

        let err = JsonFileQcStore::open(&path).unwrap_err();
        assert!(matches!(err, QcStoreError::Serialization(_)));
        assert!(err.is_infrastructure());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
