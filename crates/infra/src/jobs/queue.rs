//! FIFO retry queue over the QC status store and the job store.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use qcretry_core::{ImageId, QcStatus, RetryJobId};
use qcretry_events::{EventNotifier, RetryEvent};

use super::store::{RetryJobStats, RetryJobStore};
use super::types::{RetryJob, RetryRequest};
use crate::error::{RetryError, RetryResult};
use crate::qc_store::{QcStatusStore, QcStoreError};

/// Point-in-time queue snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub is_processing: bool,
    pub queue_length: usize,
    pub pending_jobs: usize,
    pub processing_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub current_job: Option<RetryJobId>,
}

impl From<RetryJobStats> for QueueStatus {
    fn from(stats: RetryJobStats) -> Self {
        Self {
            is_processing: stats.processing > 0,
            queue_length: stats.queued,
            pending_jobs: stats.queued,
            processing_jobs: stats.processing,
            completed_jobs: stats.completed,
            failed_jobs: stats.failed,
            current_job: stats.current,
        }
    }
}

/// Retry queue.
///
/// Submissions are serialized by a dedicated lock so that dedup, eligibility
/// checks and the `retry_pending` writes of one batch never interleave with
/// another. The worker only touches the queue for O(1) bookkeeping.
pub struct RetryQueue {
    images: Arc<dyn QcStatusStore>,
    jobs: Arc<dyn RetryJobStore>,
    notifier: Arc<EventNotifier>,
    submit: Mutex<()>,
    status: RwLock<QueueStatus>,
    wake: Mutex<()>,
    work_available: Condvar,
}

impl RetryQueue {
    pub fn new(
        images: Arc<dyn QcStatusStore>,
        jobs: Arc<dyn RetryJobStore>,
        notifier: Arc<EventNotifier>,
    ) -> Self {
        let queue = Self {
            images,
            jobs,
            notifier,
            submit: Mutex::new(()),
            status: RwLock::new(QueueStatus::default()),
            wake: Mutex::new(()),
            work_available: Condvar::new(),
        };
        queue.refresh_status();
        if let Err(e) = queue.recover_stranded() {
            warn!(error = %e, "failed to recover images left in processing");
        }
        queue
    }

    /// Return images stuck in `processing` to `retry_pending` when no job is
    /// running, e.g. after a restart over a durable QC store. Returns the ids
    /// moved.
    pub fn recover_stranded(&self) -> RetryResult<Vec<ImageId>> {
        if self.jobs.stats()?.processing > 0 {
            return Ok(Vec::new());
        }

        let mut recovered = Vec::new();
        for record in self.images.list_by_status(QcStatus::Processing)? {
            match self.images.compare_and_set_status(
                &record.id,
                QcStatus::Processing,
                QcStatus::RetryPending,
                None,
            ) {
                Ok(()) => recovered.push(record.id),
                Err(e) if e.is_infrastructure() => return Err(e.into()),
                Err(e) => debug!(image_id = %record.id, error = %e, "stranded image changed before recovery"),
            }
        }

        if !recovered.is_empty() {
            info!(images = recovered.len(), "returned stranded images to retry_pending");
        }
        Ok(recovered)
    }

    pub fn images(&self) -> &Arc<dyn QcStatusStore> {
        &self.images
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    /// Validate, dedup and filter a request, move its images to
    /// `retry_pending`, and append the job to the queue.
    pub fn enqueue(&self, request: RetryRequest) -> RetryResult<RetryJob> {
        request.validate()?;
        if request.image_ids.is_empty() {
            return Err(RetryError::EmptyBatch);
        }

        let _submit = self.submit.lock().unwrap_or_else(PoisonError::into_inner);

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        let mut skipped = Vec::new();

        for image_id in request.image_ids.iter() {
            if !seen.insert(image_id.clone()) {
                continue;
            }
            if self.arm(image_id)? {
                accepted.push(image_id.clone());
            } else {
                skipped.push(image_id.clone());
            }
        }

        if accepted.is_empty() {
            debug!(skipped = skipped.len(), "rejecting retry batch with no eligible images");
            return Err(RetryError::EmptyBatch);
        }

        let job = RetryJob::new(request, accepted, skipped);
        self.jobs.insert(job.clone())?;

        info!(
            job_id = %job.id,
            images = job.total(),
            skipped = job.skipped_image_ids.len(),
            use_original_settings = job.use_original_settings,
            include_metadata = job.include_metadata,
            "retry job queued"
        );

        self.refresh_status();
        self.publish_queue_updated();
        self.notify_worker();
        Ok(job)
    }

    /// Move one image to `retry_pending` if eligible. Returns false when the
    /// image is unknown or not eligible.
    fn arm(&self, image_id: &ImageId) -> RetryResult<bool> {
        let record = match self.images.get(image_id) {
            Ok(record) => record,
            Err(QcStoreError::NotFound(_)) => {
                debug!(image_id = %image_id, "skipping unknown image");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if !record.qc_status.is_retry_eligible() {
            debug!(image_id = %image_id, status = %record.qc_status, "skipping image not eligible for retry");
            return Ok(false);
        }
        if record.qc_status == QcStatus::RetryPending {
            return Ok(true);
        }

        match self.images.compare_and_set_status(
            image_id,
            record.qc_status,
            QcStatus::RetryPending,
            None,
        ) {
            Ok(()) => Ok(true),
            Err(e) if e.is_infrastructure() => Err(e.into()),
            Err(e) => {
                debug!(image_id = %image_id, error = %e, "skipping image that changed during submission");
                Ok(false)
            }
        }
    }

    /// Claim the oldest queued job. None while another job is processing.
    pub fn dequeue_next(&self) -> RetryResult<Option<RetryJob>> {
        let job = self.jobs.claim_next()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, cursor = job.cursor, "retry job dequeued");
            self.refresh_status();
            self.publish_queue_updated();
        }
        Ok(job)
    }

    /// Persist worker progress. Terminal jobs also refresh the snapshot and
    /// notify queue observers.
    pub fn update_job(&self, job: &RetryJob) -> RetryResult<()> {
        self.jobs.update(job)?;
        if job.status.is_terminal() {
            self.refresh_status();
            self.publish_queue_updated();
        }
        Ok(())
    }

    /// Return an unfinished job to the head of the queue.
    pub fn requeue(&self, job: &RetryJob) -> RetryResult<()> {
        self.jobs.requeue_front(job)?;
        info!(job_id = %job.id, cursor = job.cursor, "retry job requeued");
        self.refresh_status();
        self.publish_queue_updated();
        self.notify_worker();
        Ok(())
    }

    pub fn status(&self) -> QueueStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, job_id: RetryJobId) -> RetryResult<RetryJob> {
        self.jobs
            .get(job_id)?
            .ok_or(RetryError::JobNotFound(job_id))
    }

    pub fn list(&self) -> RetryResult<Vec<RetryJob>> {
        Ok(self.jobs.list()?)
    }

    /// Block until a job could be claimed or `timeout` elapses.
    /// Returns whether work looked available on wake-up.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let guard = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        if self.has_claimable_work() {
            return true;
        }
        let _ = self
            .work_available
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        self.has_claimable_work()
    }

    /// Wake a worker blocked in [`RetryQueue::wait_for_work`].
    pub fn notify_worker(&self) {
        let _guard = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        self.work_available.notify_all();
    }

    fn has_claimable_work(&self) -> bool {
        let status = self.status();
        status.queue_length > 0 && !status.is_processing
    }

    /// Re-read the job counters into the snapshot. The snapshot lock is held
    /// across the read so a slower refresh cannot overwrite a newer one.
    fn refresh_status(&self) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        match self.jobs.stats() {
            Ok(stats) => *status = stats.into(),
            Err(e) => warn!(error = %e, "failed to refresh queue status"),
        }
    }

    fn publish_queue_updated(&self) {
        let status = self.status();
        self.notifier
            .publish(RetryEvent::queue_updated(status.queue_length, status.is_processing));
    }
}

impl core::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
