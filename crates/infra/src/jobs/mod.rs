//! Retry jobs: types, storage, the FIFO queue, the step chain and the worker.
//!
//! ## Flow
//!
//! - `RetryQueue::enqueue` validates a batch, moves its images to
//!   `retry_pending` and appends a `RetryJob`
//! - `RetryWorker` claims one job at a time and runs each image through the
//!   `StepRunner`, resolving it to `approved` or `retry_failed`
//! - Progress is persisted per image, so a job stopped at an image boundary
//!   resumes where it left off

pub mod queue;
pub mod steps;
pub mod store;
pub mod types;
pub mod worker;

pub use queue::{QueueStatus, RetryQueue};
pub use steps::{ChainOutcome, ImageArtifact, ImageProcessor, StepError, StepRunner};
pub use store::{InMemoryRetryJobStore, RetryJobStats, RetryJobStore, RetryJobStoreError};
pub use types::{RetryJob, RetryJobStatus, RetryRequest};
pub use worker::{JobRun, RetryWorker, RetryWorkerHandle, WorkerStats};
