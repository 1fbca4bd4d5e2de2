//! Shared fixtures for retry scenario tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use qcretry_core::{
    ExecutionId, FailurePhase, ImageId, ImageMetadata, ImageRecord, ProcessingSettings, QcStatus,
    Step,
};
use qcretry_events::{RetryEvent, Subscription};
use qcretry_infra::{
    ImageArtifact, ImageProcessor, InMemoryQcStore, ProcessingResult, QcStatusStore,
    QcStoreError, StepError,
};

pub fn failed_image(id: &str) -> ImageRecord {
    ImageRecord::qc_failed(id, "exec-1", "qc: blurry")
        .with_prompt(format!("a product photo of {id}"), Some(42))
        .with_temp_path(format!("/tmp/gen/{id}.png"))
}

pub fn store_with(ids: &[&str]) -> Arc<InMemoryQcStore> {
    Arc::new(InMemoryQcStore::with_records(ids.iter().map(|id| failed_image(id))))
}

pub fn ids(raw: &[&str]) -> Vec<ImageId> {
    raw.iter().map(|s| ImageId::from(*s)).collect()
}

pub fn status_of(store: &dyn QcStatusStore, id: &str) -> QcStatus {
    store.get(&ImageId::from(id)).unwrap().qc_status
}

/// A gate steps can block on until the test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

/// Scriptable processor keyed by image file stem.
#[derive(Default)]
pub struct FakeProcessor {
    failures: HashMap<(String, Step), FailurePhase>,
    stalls: HashMap<(String, Step), Duration>,
    gated: HashSet<String>,
    pub gate: Arc<Gate>,
    pub calls: AtomicUsize,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, image: &str, step: Step, phase: FailurePhase) -> Self {
        self.failures.insert((image.to_string(), step), phase);
        self
    }

    pub fn stalling(mut self, image: &str, step: Step, delay: Duration) -> Self {
        self.stalls.insert((image.to_string(), step), delay);
        self
    }

    /// Block `convert` for this image until the gate opens.
    pub fn gated_on(mut self, image: &str) -> Self {
        self.gated.insert(image.to_string());
        self
    }

    fn stem(image: &ImageArtifact) -> String {
        image
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn step(&self, step: Step, image: &ImageArtifact, ext: &str) -> Result<ImageArtifact, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stem = Self::stem(image);

        if step == Step::Convert && self.gated.contains(&stem) {
            self.gate.wait();
        }
        if let Some(delay) = self.stalls.get(&(stem.clone(), step)) {
            std::thread::sleep(*delay);
        }
        match self.failures.get(&(stem.clone(), step)) {
            Some(FailurePhase::Execute) => Err(StepError::execute(anyhow!("{step} service returned 502"))),
            Some(FailurePhase::Encode) => Err(StepError::encode(anyhow!("{step} could not write output"))),
            None => Ok(ImageArtifact::new(PathBuf::from("/out").join(format!("{stem}.{ext}")))),
        }
    }
}

impl ImageProcessor for FakeProcessor {
    fn remove_background(&self, image: &ImageArtifact, _: &ProcessingSettings) -> Result<ImageArtifact, StepError> {
        self.step(Step::RemoveBg, image, "png")
    }

    fn trim(&self, image: &ImageArtifact) -> Result<ImageArtifact, StepError> {
        self.step(Step::Trim, image, "png")
    }

    fn enhance(&self, image: &ImageArtifact, _: &ProcessingSettings) -> Result<ImageArtifact, StepError> {
        self.step(Step::Enhancement, image, "png")
    }

    fn convert_and_save(&self, image: &ImageArtifact, settings: &ProcessingSettings) -> Result<ImageArtifact, StepError> {
        self.step(Step::Convert, image, settings.convert_to_format.extension())
    }

    fn regenerate_metadata(&self, image: &ImageArtifact, record: &ImageRecord) -> Result<ImageMetadata, StepError> {
        self.step(Step::Metadata, image, "json").map(|_| ImageMetadata {
            title: format!("Retried {}", record.id),
            description: record.generation_prompt.clone(),
            tags: vec!["retry".to_string()],
        })
    }
}

/// Store wrapper that fails status writes to one target status.
pub struct FlakyStore {
    inner: InMemoryQcStore,
    fail_on: Mutex<Option<QcStatus>>,
}

impl FlakyStore {
    pub fn new(inner: InMemoryQcStore) -> Self {
        Self {
            inner,
            fail_on: Mutex::new(None),
        }
    }

    pub fn fail_writes_to(&self, status: QcStatus) {
        *self.fail_on.lock().unwrap() = Some(status);
    }

    fn check(&self, status: QcStatus) -> Result<(), QcStoreError> {
        if *self.fail_on.lock().unwrap() == Some(status) {
            return Err(QcStoreError::Unavailable("database is locked".to_string()));
        }
        Ok(())
    }
}

impl QcStatusStore for FlakyStore {
    fn get(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        self.inner.get(image_id)
    }

    fn insert(&self, record: ImageRecord) -> Result<(), QcStoreError> {
        self.inner.insert(record)
    }

    fn set_status(&self, image_id: &ImageId, status: QcStatus, reason: Option<String>) -> Result<(), QcStoreError> {
        self.check(status)?;
        self.inner.set_status(image_id, status, reason)
    }

    fn compare_and_set_status(
        &self,
        image_id: &ImageId,
        expected: QcStatus,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(), QcStoreError> {
        self.check(status)?;
        self.inner.compare_and_set_status(image_id, expected, status, reason)
    }

    fn set_processing_result(&self, image_id: &ImageId, result: ProcessingResult) -> Result<(), QcStoreError> {
        self.inner.set_processing_result(image_id, result)
    }

    fn list_by_status(&self, status: QcStatus) -> Result<Vec<ImageRecord>, QcStoreError> {
        self.inner.list_by_status(status)
    }

    fn list_by_execution(&self, execution_id: &ExecutionId) -> Result<Vec<ImageRecord>, QcStoreError> {
        self.inner.list_by_execution(execution_id)
    }

    fn remove(&self, image_id: &ImageId) -> Result<ImageRecord, QcStoreError> {
        self.inner.remove(image_id)
    }
}

/// Receive events until one matches, or panic after `timeout`.
pub fn wait_for_event(
    sub: &Subscription<RetryEvent>,
    timeout: Duration,
    mut matches: impl FnMut(&RetryEvent) -> bool,
) -> RetryEvent {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match sub.recv_timeout(remaining) {
            Ok(event) if matches(&event) => return event,
            Ok(_) => continue,
            Err(e) => panic!("no matching event within {timeout:?}: {e}"),
        }
    }
}
