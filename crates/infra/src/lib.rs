//! Infrastructure layer: QC status stores, the retry queue and worker,
//! configuration, and the service surface.

pub mod config;
pub mod error;
pub mod jobs;
pub mod qc_store;
pub mod service;

pub use config::RetryConfig;
pub use error::{RetryError, RetryResult};
pub use jobs::{
    ChainOutcome, ImageArtifact, ImageProcessor, InMemoryRetryJobStore, JobRun, QueueStatus,
    RetryJob, RetryJobStats, RetryJobStatus, RetryJobStore, RetryJobStoreError, RetryQueue,
    RetryRequest, RetryWorker, RetryWorkerHandle, StepError, StepRunner, WorkerStats,
};
pub use qc_store::{
    InMemoryQcStore, JsonFileQcStore, ProcessingResult, QcStatusStore, QcStoreError,
};
pub use service::{RetryService, SubmitRetryResponse};
