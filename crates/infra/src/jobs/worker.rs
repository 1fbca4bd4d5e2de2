//! Retry worker: the single consumer of the retry queue.

use std::io;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use qcretry_core::{ImageId, ImageRecord, QcStatus, RetryJobId};
use qcretry_events::{ImageOutcome, JobCompletedEvent, RetryEvent, RetryEventPayload};

use super::queue::RetryQueue;
use super::steps::{ChainOutcome, ImageProcessor, StepRunner};
use super::types::RetryJob;
use crate::config::RetryConfig;
use crate::error::RetryResult;
use crate::qc_store::{ProcessingResult, QcStoreError};

const IMAGE_GONE: &str = "image no longer exists";
const CLAIM_ATTEMPTS: usize = 3;
const FINISH_ATTEMPTS: usize = 3;

/// Handle to control a running worker.
#[derive(Debug)]
pub struct RetryWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    queue: Arc<RetryQueue>,
}

impl RetryWorkerHandle {
    /// Request shutdown and wait for the worker to reach the next image
    /// boundary. An unfinished job goes back to the head of the queue.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        self.queue.notify_worker();
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("retry worker thread panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub images_approved: u64,
    pub images_failed: u64,
    pub current_job: Option<RetryJobId>,
    pub uptime_secs: u64,
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    /// Aborted by an infrastructure error.
    Failed,
    /// Stopped at an image boundary and requeued.
    Interrupted,
}

enum Claim {
    Claimed(ImageRecord),
    AlreadyApproved,
    Unavailable(&'static str),
}

/// Processes retry jobs one at a time.
pub struct RetryWorker {
    queue: Arc<RetryQueue>,
    runner: StepRunner,
    config: RetryConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl RetryWorker {
    pub fn new(
        queue: Arc<RetryQueue>,
        processor: Arc<dyn ImageProcessor>,
        config: RetryConfig,
    ) -> Self {
        Self {
            queue,
            runner: StepRunner::new(processor, config.clone()),
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawn the worker on a dedicated thread.
    pub fn spawn(self) -> io::Result<RetryWorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let queue = self.queue.clone();

        let join = thread::Builder::new()
            .name(self.config.worker_name.clone())
            .spawn(move || worker_loop(self, shutdown_rx))?;

        Ok(RetryWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            queue,
        })
    }

    /// Drain the queue on the calling thread. Returns the number of jobs run.
    pub fn run_until_idle(&self) -> RetryResult<usize> {
        let mut ran = 0;
        while let Some(job) = self.queue.dequeue_next()? {
            self.run_job(job, &|| false);
            ran += 1;
        }
        Ok(ran)
    }

    /// Run one claimed job from its cursor to the end, or until `should_stop`
    /// reports true at an image boundary.
    pub fn run_job(&self, mut job: RetryJob, should_stop: &dyn Fn() -> bool) -> JobRun {
        let total = job.total();
        info!(
            worker = %self.config.worker_name,
            job_id = %job.id,
            images = total,
            cursor = job.cursor,
            "retry job started"
        );
        self.with_stats(|s| s.current_job = Some(job.id));

        while let Some(image_id) = job.image_ids.get(job.cursor).cloned() {
            let outcome = match self.process_image(&job, job.cursor, &image_id) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.abort_job(job, &image_id, &e.to_string());
                    return JobRun::Failed;
                }
            };

            job.record(outcome);
            self.with_stats(|s| match outcome {
                ImageOutcome::Approved => s.images_approved += 1,
                ImageOutcome::RetryFailed => s.images_failed += 1,
            });

            if let Err(e) = self.queue.update_job(&job) {
                error!(job_id = %job.id, error = %e, "failed to record retry progress");
                self.abort_job(job, &image_id, &e.to_string());
                return JobRun::Failed;
            }

            if !job.is_exhausted() && should_stop() {
                return self.interrupt_job(job);
            }
        }

        job.mark_completed();
        if let Err(e) = self.finish(&job) {
            error!(job_id = %job.id, error = %e, "failed to mark retry job completed");
            self.queue.notifier().publish(RetryEvent::error(
                job.id,
                format!("failed to record job completion: {e}"),
            ));
        }

        info!(
            worker = %self.config.worker_name,
            job_id = %job.id,
            success = job.success_count,
            failure = job.failure_count,
            "retry job completed"
        );

        self.queue
            .notifier()
            .publish(RetryEvent::new(RetryEventPayload::Completed(JobCompletedEvent {
                job_id: job.id,
                total,
                success_count: job.success_count,
                failure_count: job.failure_count,
                output_dir: self.config.output_dir.clone(),
            })));

        self.with_stats(|s| {
            s.jobs_processed += 1;
            s.jobs_completed += 1;
            s.current_job = None;
        });
        JobRun::Completed
    }

    /// Retry one image. Only infrastructure errors are returned; everything
    /// else resolves to an outcome.
    fn process_image(
        &self,
        job: &RetryJob,
        index: usize,
        image_id: &ImageId,
    ) -> Result<ImageOutcome, QcStoreError> {
        let notifier = self.queue.notifier();
        let claim = self.claim(image_id)?;
        notifier.publish(RetryEvent::progress(job.id, image_id.clone(), index, job.total()));

        let record = match claim {
            Claim::Claimed(record) => record,
            Claim::AlreadyApproved => {
                debug!(job_id = %job.id, image_id = %image_id, "image approved before retry, skipping steps");
                return Ok(self.complete(job, image_id, ImageOutcome::Approved, None));
            }
            Claim::Unavailable(reason) => {
                debug!(job_id = %job.id, image_id = %image_id, reason, "image unavailable for retry");
                return Ok(self.complete(
                    job,
                    image_id,
                    ImageOutcome::RetryFailed,
                    Some(reason.to_string()),
                ));
            }
        };

        let settings = job.effective_settings(&record);
        let chain = self
            .runner
            .run(&record, &settings, job.include_metadata, &job.failure_policy);

        let (outcome, reason) = match chain {
            ChainOutcome::Succeeded {
                artifact,
                metadata,
                soft_failures,
            } => {
                if !soft_failures.is_empty() {
                    debug!(image_id = %image_id, soft_failures = soft_failures.len(), "image retried with soft failures");
                }
                let result = ProcessingResult {
                    final_image_path: Some(artifact.path),
                    metadata,
                    processing_settings: Some(settings),
                };
                match self.queue.images().set_processing_result(image_id, result) {
                    Ok(()) => self.resolve(image_id, QcStatus::Approved, None)?,
                    Err(e) if e.is_infrastructure() => return Err(e),
                    Err(_) => (ImageOutcome::RetryFailed, Some(IMAGE_GONE.to_string())),
                }
            }
            ChainOutcome::HardFailed { reason, .. } => {
                self.resolve(image_id, QcStatus::RetryFailed, Some(reason))?
            }
        };

        Ok(self.complete(job, image_id, outcome, reason))
    }

    /// Move a claimed image to `retry_pending` → `processing`, re-arming
    /// images that were sent back to the failed pool while queued.
    fn claim(&self, image_id: &ImageId) -> Result<Claim, QcStoreError> {
        let images = self.queue.images();

        for _ in 0..CLAIM_ATTEMPTS {
            let mut record = match images.get(image_id) {
                Ok(record) => record,
                Err(QcStoreError::NotFound(_)) => return Ok(Claim::Unavailable(IMAGE_GONE)),
                Err(e) => return Err(e),
            };

            let written = match record.qc_status {
                QcStatus::Approved => return Ok(Claim::AlreadyApproved),
                QcStatus::Processing => return Ok(Claim::Unavailable("image is already being processed")),
                QcStatus::QcFailed | QcStatus::RetryFailed => images
                    .compare_and_set_status(image_id, record.qc_status, QcStatus::RetryPending, None)
                    .and_then(|()| {
                        images.compare_and_set_status(
                            image_id,
                            QcStatus::RetryPending,
                            QcStatus::Processing,
                            None,
                        )
                    }),
                QcStatus::RetryPending => images.compare_and_set_status(
                    image_id,
                    QcStatus::RetryPending,
                    QcStatus::Processing,
                    None,
                ),
            };

            match written {
                Ok(()) => {
                    record.qc_status = QcStatus::Processing;
                    record.qc_reason = None;
                    return Ok(Claim::Claimed(record));
                }
                Err(QcStoreError::NotFound(_)) => return Ok(Claim::Unavailable(IMAGE_GONE)),
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(e) => debug!(image_id = %image_id, error = %e, "claim raced, re-reading"),
            }
        }

        Ok(Claim::Unavailable("qc status kept changing during claim"))
    }

    /// Final status write for a processed image.
    fn resolve(
        &self,
        image_id: &ImageId,
        status: QcStatus,
        reason: Option<String>,
    ) -> Result<(ImageOutcome, Option<String>), QcStoreError> {
        let outcome = match status {
            QcStatus::Approved => ImageOutcome::Approved,
            _ => ImageOutcome::RetryFailed,
        };
        match self.queue.images().compare_and_set_status(
            image_id,
            QcStatus::Processing,
            status,
            reason.clone(),
        ) {
            Ok(()) => Ok((outcome, reason)),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(QcStoreError::NotFound(_)) => {
                Ok((ImageOutcome::RetryFailed, Some(IMAGE_GONE.to_string())))
            }
            Err(e) => {
                warn!(image_id = %image_id, error = %e, "qc status changed while retrying");
                Ok((ImageOutcome::RetryFailed, Some(e.to_string())))
            }
        }
    }

    fn complete(
        &self,
        job: &RetryJob,
        image_id: &ImageId,
        outcome: ImageOutcome,
        reason: Option<String>,
    ) -> ImageOutcome {
        debug!(job_id = %job.id, image_id = %image_id, outcome = ?outcome, reason = ?reason, "image retry finished");
        self.queue.notifier().publish(RetryEvent::image_completed(
            job.id,
            image_id.clone(),
            outcome,
            reason,
        ));
        outcome
    }

    fn abort_job(&self, mut job: RetryJob, in_flight: &ImageId, message: &str) {
        error!(
            worker = %self.config.worker_name,
            job_id = %job.id,
            image_id = %in_flight,
            error = %message,
            "retry job aborted"
        );

        // Best effort: the image may never have been claimed.
        if let Err(e) = self.queue.images().compare_and_set_status(
            in_flight,
            QcStatus::Processing,
            QcStatus::RetryPending,
            None,
        ) {
            debug!(image_id = %in_flight, error = %e, "could not revert in-flight image");
        }

        job.mark_failed(message);
        let message = match self.finish(&job) {
            Ok(()) => message.to_string(),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to mark retry job failed");
                format!("{message}; failed to record job failure: {e}")
            }
        };
        self.queue
            .notifier()
            .publish(RetryEvent::error(job.id, message));

        self.with_stats(|s| {
            s.jobs_processed += 1;
            s.jobs_failed += 1;
            s.current_job = None;
        });
    }

    /// Persist a terminal job state. A job store still holding the job as
    /// `processing` would block every later claim, so transient failures are
    /// retried.
    fn finish(&self, job: &RetryJob) -> RetryResult<()> {
        let mut attempt = 1;
        loop {
            match self.queue.update_job(job) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    warn!(job_id = %job.id, attempt, error = %e, "failed to record final job state, retrying");
                    thread::sleep(self.config.poll_interval);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn interrupt_job(&self, job: RetryJob) -> JobRun {
        info!(
            worker = %self.config.worker_name,
            job_id = %job.id,
            cursor = job.cursor,
            "shutdown requested, returning retry job to the queue"
        );
        if let Err(e) = self.queue.requeue(&job) {
            error!(job_id = %job.id, error = %e, "failed to requeue retry job");
        }
        self.with_stats(|s| {
            s.jobs_requeued += 1;
            s.current_job = None;
        });
        JobRun::Interrupted
    }

    fn with_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl core::fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryWorker")
            .field("name", &self.config.worker_name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A dropped handle counts as a shutdown request.
fn shutdown_requested(rx: &mpsc::Receiver<()>) -> bool {
    match rx.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

fn worker_loop(worker: RetryWorker, shutdown_rx: mpsc::Receiver<()>) {
    info!(worker = %worker.config.worker_name, "retry worker started");
    let start_time = Instant::now();
    let should_stop = || shutdown_requested(&shutdown_rx);

    loop {
        if should_stop() {
            break;
        }

        worker.with_stats(|s| s.uptime_secs = start_time.elapsed().as_secs());

        match worker.queue.dequeue_next() {
            Ok(Some(job)) => {
                if worker.run_job(job, &should_stop) == JobRun::Interrupted {
                    break;
                }
            }
            Ok(None) => {
                worker.queue.wait_for_work(worker.config.poll_interval);
            }
            Err(e) => {
                error!(worker = %worker.config.worker_name, error = %e, "failed to claim retry job");
                thread::sleep(worker.config.poll_interval);
            }
        }
    }

    info!(worker = %worker.config.worker_name, "retry worker stopped");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use qcretry_core::{ImageMetadata, ProcessingSettings};
    use qcretry_events::EventNotifier;

    use super::*;
    use crate::jobs::steps::{ImageArtifact, StepError};
    use crate::jobs::store::{InMemoryRetryJobStore, RetryJobStats, RetryJobStore, RetryJobStoreError};
    use crate::jobs::types::{RetryJobStatus, RetryRequest};
    use crate::qc_store::{InMemoryQcStore, QcStatusStore};

    struct PassThrough;

    impl ImageProcessor for PassThrough {
        fn remove_background(&self, image: &ImageArtifact, _: &ProcessingSettings) -> Result<ImageArtifact, StepError> {
            Ok(image.clone())
        }

        fn trim(&self, image: &ImageArtifact) -> Result<ImageArtifact, StepError> {
            Ok(image.clone())
        }

        fn enhance(&self, image: &ImageArtifact, _: &ProcessingSettings) -> Result<ImageArtifact, StepError> {
            Ok(image.clone())
        }

        fn convert_and_save(&self, image: &ImageArtifact, settings: &ProcessingSettings) -> Result<ImageArtifact, StepError> {
            let stem = image.path.file_stem().unwrap_or_default().to_string_lossy();
            Ok(ImageArtifact::new(format!(
                "/out/{stem}.{}",
                settings.convert_to_format.extension()
            )))
        }

        fn regenerate_metadata(&self, _: &ImageArtifact, record: &ImageRecord) -> Result<ImageMetadata, StepError> {
            Ok(ImageMetadata {
                title: format!("Image {}", record.id),
                ..Default::default()
            })
        }
    }

    fn setup(ids: &[&str]) -> (Arc<RetryQueue>, Arc<InMemoryQcStore>, RetryWorker) {
        let images = Arc::new(InMemoryQcStore::with_records(ids.iter().map(|id| {
            ImageRecord::qc_failed(*id, "exec-1", "blurry").with_temp_path(format!("/tmp/{id}.png"))
        })));
        let queue = Arc::new(RetryQueue::new(
            images.clone(),
            InMemoryRetryJobStore::arc(),
            Arc::new(EventNotifier::new()),
        ));
        let worker = RetryWorker::new(queue.clone(), Arc::new(PassThrough), RetryConfig::default());
        (queue, images, worker)
    }

    #[test]
    fn approves_and_records_results() {
        let (queue, images, worker) = setup(&["a"]);
        let job = queue
            .enqueue(RetryRequest::original(["a"]).with_metadata(true))
            .unwrap();

        assert_eq!(worker.run_until_idle().unwrap(), 1);

        let record = images.get(&ImageId::from("a")).unwrap();
        assert_eq!(record.qc_status, QcStatus::Approved);
        assert_eq!(record.final_image_path, Some(PathBuf::from("/out/a.png")));
        assert_eq!(record.metadata.unwrap().title, "Image a");

        let job = queue.get(job.id).unwrap();
        assert_eq!(job.status, RetryJobStatus::Completed);
        assert_eq!((job.success_count, job.failure_count), (1, 0));
        assert_eq!(worker.stats().images_approved, 1);
    }

    #[test]
    fn deleted_image_counts_as_failure() {
        let (queue, images, worker) = setup(&["a", "b"]);
        let job = queue.enqueue(RetryRequest::original(["a", "b"])).unwrap();
        images.remove(&ImageId::from("a")).unwrap();

        worker.run_until_idle().unwrap();

        let job = queue.get(job.id).unwrap();
        assert_eq!((job.success_count, job.failure_count), (1, 1));
    }

    #[test]
    fn events_follow_the_image_lifecycle() {
        let (queue, _, worker) = setup(&["a"]);
        let sub = queue.notifier().subscribe();
        queue.enqueue(RetryRequest::original(["a"])).unwrap();

        worker.run_until_idle().unwrap();

        let types: Vec<_> = sub.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "retry.queue.updated",
                "retry.queue.updated",
                "retry.progress",
                "retry.image.completed",
                "retry.queue.updated",
                "retry.job.completed",
            ]
        );
    }

    #[test]
    fn interrupted_job_is_requeued_with_its_cursor() {
        let (queue, images, worker) = setup(&["a", "b"]);
        let job = queue.enqueue(RetryRequest::original(["a", "b"])).unwrap();

        let claimed = queue.dequeue_next().unwrap().unwrap();
        assert_eq!(worker.run_job(claimed, &|| true), JobRun::Interrupted);

        let requeued = queue.get(job.id).unwrap();
        assert_eq!(requeued.status, RetryJobStatus::Queued);
        assert_eq!(requeued.cursor, 1);
        assert_eq!(images.get(&ImageId::from("b")).unwrap().qc_status, QcStatus::RetryPending);
        assert_eq!(queue.status().queue_length, 1);

        worker.run_until_idle().unwrap();
        let finished = queue.get(job.id).unwrap();
        assert_eq!(finished.status, RetryJobStatus::Completed);
        assert_eq!(finished.success_count, 2);
    }

    /// Job store that rejects the next `n` terminal writes.
    struct RejectTerminalWrites {
        inner: InMemoryRetryJobStore,
        remaining: AtomicUsize,
    }

    impl RetryJobStore for RejectTerminalWrites {
        fn insert(&self, job: RetryJob) -> Result<(), RetryJobStoreError> {
            self.inner.insert(job)
        }

        fn get(&self, job_id: RetryJobId) -> Result<Option<RetryJob>, RetryJobStoreError> {
            self.inner.get(job_id)
        }

        fn update(&self, job: &RetryJob) -> Result<(), RetryJobStoreError> {
            let reject = job.status.is_terminal()
                && self
                    .remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if reject {
                return Err(RetryJobStoreError::Storage("disk full".into()));
            }
            self.inner.update(job)
        }

        fn claim_next(&self) -> Result<Option<RetryJob>, RetryJobStoreError> {
            self.inner.claim_next()
        }

        fn requeue_front(&self, job: &RetryJob) -> Result<(), RetryJobStoreError> {
            self.inner.requeue_front(job)
        }

        fn list(&self) -> Result<Vec<RetryJob>, RetryJobStoreError> {
            self.inner.list()
        }

        fn stats(&self) -> Result<RetryJobStats, RetryJobStoreError> {
            self.inner.stats()
        }
    }

    fn setup_rejecting(ids: &[&str], rejections: usize) -> (Arc<RetryQueue>, RetryWorker) {
        let images = Arc::new(InMemoryQcStore::with_records(ids.iter().map(|id| {
            ImageRecord::qc_failed(*id, "exec-1", "blurry").with_temp_path(format!("/tmp/{id}.png"))
        })));
        let jobs = Arc::new(RejectTerminalWrites {
            inner: InMemoryRetryJobStore::new(),
            remaining: AtomicUsize::new(rejections),
        });
        let queue = Arc::new(RetryQueue::new(images, jobs, Arc::new(EventNotifier::new())));
        let config = RetryConfig::default().with_poll_interval(Duration::from_millis(1));
        let worker = RetryWorker::new(queue.clone(), Arc::new(PassThrough), config);
        (queue, worker)
    }

    #[test]
    fn transient_failure_marking_a_job_done_does_not_stall_the_queue() {
        let (queue, worker) = setup_rejecting(&["a", "b"], 1);
        let first = queue.enqueue(RetryRequest::original(["a"])).unwrap();
        let second = queue.enqueue(RetryRequest::original(["b"])).unwrap();

        assert_eq!(worker.run_until_idle().unwrap(), 2);

        for id in [first.id, second.id] {
            assert_eq!(queue.get(id).unwrap().status, RetryJobStatus::Completed);
        }
        assert!(!queue.status().is_processing);
    }

    #[test]
    fn persistent_failure_marking_a_job_done_is_reported() {
        let (queue, worker) = setup_rejecting(&["a"], usize::MAX);
        let sub = queue.notifier().subscribe();
        let job = queue.enqueue(RetryRequest::original(["a"])).unwrap();

        worker.run_until_idle().unwrap();

        let errors: Vec<_> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e.payload {
                RetryEventPayload::Error(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].job_id, job.id);
        assert!(errors[0].message.contains("disk full"));
    }
}
