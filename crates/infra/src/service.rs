//! `RetryService`: the surface exposed to the UI bridge.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use qcretry_core::{
    DomainError, FailurePolicy, ImageId, ImageRecord, ProcessingSettings, QcStatus, RetryJobId,
};
use qcretry_events::{EventKind, EventNotifier, ListenerId, RetryEvent, Subscription};

use crate::config::RetryConfig;
use crate::error::RetryResult;
use crate::jobs::{
    ImageProcessor, InMemoryRetryJobStore, QueueStatus, RetryJob, RetryJobStore, RetryQueue,
    RetryRequest, RetryWorker, RetryWorkerHandle,
};
use crate::qc_store::QcStatusStore;

/// Reply to a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRetryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<RetryJobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_image_ids: Vec<ImageId>,
}

impl SubmitRetryResponse {
    fn from_result(result: RetryResult<RetryJob>) -> Self {
        match result {
            Ok(job) => Self {
                success: true,
                job_id: Some(job.id),
                error: None,
                skipped_image_ids: job.skipped_image_ids,
            },
            Err(e) => Self {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
                skipped_image_ids: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryService {
    queue: Arc<RetryQueue>,
}

impl RetryService {
    pub fn new(images: Arc<dyn QcStatusStore>, jobs: Arc<dyn RetryJobStore>) -> Self {
        Self::with_notifier(images, jobs, Arc::new(EventNotifier::new()))
    }

    /// Service with an in-memory job store.
    pub fn in_memory(images: Arc<dyn QcStatusStore>) -> Self {
        Self::new(images, InMemoryRetryJobStore::arc())
    }

    pub fn with_notifier(
        images: Arc<dyn QcStatusStore>,
        jobs: Arc<dyn RetryJobStore>,
        notifier: Arc<EventNotifier>,
    ) -> Self {
        Self {
            queue: Arc::new(RetryQueue::new(images, jobs, notifier)),
        }
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    /// A worker bound to this service's queue.
    pub fn worker(&self, processor: Arc<dyn ImageProcessor>, config: RetryConfig) -> RetryWorker {
        RetryWorker::new(self.queue.clone(), processor, config)
    }

    pub fn spawn_worker(
        &self,
        processor: Arc<dyn ImageProcessor>,
        config: RetryConfig,
    ) -> io::Result<RetryWorkerHandle> {
        self.worker(processor, config).spawn()
    }

    pub fn submit_retry_batch(
        &self,
        image_ids: Vec<ImageId>,
        use_original_settings: bool,
        modified_settings: Option<ProcessingSettings>,
        include_metadata: bool,
    ) -> SubmitRetryResponse {
        self.submit_retry_batch_with_policy(
            image_ids,
            use_original_settings,
            modified_settings,
            include_metadata,
            FailurePolicy::defaults(),
        )
    }

    pub fn submit_retry_batch_with_policy(
        &self,
        image_ids: Vec<ImageId>,
        use_original_settings: bool,
        modified_settings: Option<ProcessingSettings>,
        include_metadata: bool,
        failure_policy: FailurePolicy,
    ) -> SubmitRetryResponse {
        let request = RetryRequest {
            image_ids,
            use_original_settings,
            modified_settings,
            include_metadata,
            failure_policy,
        };
        let result = self.submit(request);
        if let Err(e) = &result {
            warn!(error = %e, "retry batch rejected");
        }
        SubmitRetryResponse::from_result(result)
    }

    pub fn submit(&self, request: RetryRequest) -> RetryResult<RetryJob> {
        self.queue.enqueue(request)
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn get_images_by_status(&self, status: QcStatus) -> RetryResult<Vec<ImageRecord>> {
        Ok(self.queue.images().list_by_status(status)?)
    }

    pub fn get_image(&self, image_id: &ImageId) -> RetryResult<ImageRecord> {
        Ok(self.queue.images().get(image_id)?)
    }

    pub fn get_job(&self, job_id: RetryJobId) -> RetryResult<RetryJob> {
        self.queue.get(job_id)
    }

    pub fn list_jobs(&self) -> RetryResult<Vec<RetryJob>> {
        self.queue.list()
    }

    /// Manual approve of a failed image, bypassing reprocessing.
    pub fn approve_image(&self, image_id: &ImageId) -> RetryResult<ImageRecord> {
        let images = self.queue.images();
        let current = images.get(image_id)?.qc_status;
        if !current.is_manually_approvable() {
            return Err(DomainError::illegal_transition(current, QcStatus::Approved).into());
        }
        images.compare_and_set_status(image_id, current, QcStatus::Approved, None)?;
        info!(image_id = %image_id, from = %current, "image approved manually");
        Ok(images.get(image_id)?)
    }

    /// Send an image back to the failed pool with a new reason.
    pub fn reject_image(
        &self,
        image_id: &ImageId,
        reason: impl Into<String>,
    ) -> RetryResult<ImageRecord> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(DomainError::validation("reject reason must not be empty").into());
        }
        let images = self.queue.images();
        let current = images.get(image_id)?.qc_status;
        images.compare_and_set_status(image_id, current, QcStatus::QcFailed, Some(reason))?;
        info!(image_id = %image_id, from = %current, "image rejected manually");
        Ok(images.get(image_id)?)
    }

    /// Delete from any status. A queued job skips the image when it gets there.
    pub fn delete_image(&self, image_id: &ImageId) -> RetryResult<ImageRecord> {
        let removed = self.queue.images().remove(image_id)?;
        info!(image_id = %image_id, status = %removed.qc_status, "image deleted");
        Ok(removed)
    }

    pub fn on_progress<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.queue.notifier().on(EventKind::Progress, listener)
    }

    pub fn on_completed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.queue.notifier().on(EventKind::Completed, listener)
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.queue.notifier().on(EventKind::Error, listener)
    }

    pub fn on_queue_updated<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.queue.notifier().on(EventKind::QueueUpdated, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.queue.notifier().off(id)
    }

    /// Channel subscription to every event.
    pub fn subscribe(&self) -> Subscription<RetryEvent> {
        self.queue.notifier().subscribe()
    }
}
