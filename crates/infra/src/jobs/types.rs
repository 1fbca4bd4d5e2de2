//! Retry job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use qcretry_core::{
    DomainError, DomainResult, FailurePolicy, ImageId, ImageRecord, ProcessingSettings, RetryJobId,
};
use qcretry_events::ImageOutcome;

/// Retry job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryJobStatus {
    /// Waiting in the queue
    Queued,
    /// Owned by the worker
    Processing,
    /// Every image resolved (failures are reported through `failure_count`)
    Completed,
    /// Aborted by an infrastructure error
    Failed,
}

impl RetryJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryJobStatus::Completed | RetryJobStatus::Failed)
    }
}

/// A batch retry submission, before validation and dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub image_ids: Vec<ImageId>,
    pub use_original_settings: bool,
    #[serde(default)]
    pub modified_settings: Option<ProcessingSettings>,
    #[serde(default)]
    pub include_metadata: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl RetryRequest {
    /// Reapply each image's stored settings.
    pub fn original<I>(image_ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ImageId>,
    {
        Self {
            image_ids: image_ids.into_iter().map(Into::into).collect(),
            use_original_settings: true,
            modified_settings: None,
            include_metadata: false,
            failure_policy: FailurePolicy::defaults(),
        }
    }

    /// Apply one settings object to every image of the batch.
    pub fn modified<I>(image_ids: I, settings: ProcessingSettings) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ImageId>,
    {
        Self {
            use_original_settings: false,
            modified_settings: Some(settings),
            ..Self::original(image_ids)
        }
    }

    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// `modifiedSettings` must be present exactly when `useOriginalSettings`
    /// is false.
    pub fn validate(&self) -> DomainResult<()> {
        match (self.use_original_settings, &self.modified_settings) {
            (true, None) => Ok(()),
            (true, Some(_)) => Err(DomainError::validation(
                "modifiedSettings must be omitted when useOriginalSettings is true",
            )),
            (false, Some(settings)) => settings.validate(),
            (false, None) => Err(DomainError::validation(
                "modifiedSettings is required when useOriginalSettings is false",
            )),
        }
    }
}

/// A queued or historical retry batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    pub id: RetryJobId,
    pub image_ids: Vec<ImageId>,
    pub use_original_settings: bool,
    pub modified_settings: Option<ProcessingSettings>,
    pub include_metadata: bool,
    pub failure_policy: FailurePolicy,
    pub status: RetryJobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success_count: usize,
    pub failure_count: usize,
    /// Index into `image_ids` of the next image to process.
    pub cursor: usize,
    pub error: Option<String>,
    /// Ids dropped at submission (unknown or not eligible).
    pub skipped_image_ids: Vec<ImageId>,
}

impl RetryJob {
    /// Build a queued job from a validated request and the ids that survived
    /// dedup and eligibility filtering.
    pub fn new(request: RetryRequest, image_ids: Vec<ImageId>, skipped: Vec<ImageId>) -> Self {
        Self {
            id: RetryJobId::new(),
            image_ids,
            use_original_settings: request.use_original_settings,
            modified_settings: request.modified_settings,
            include_metadata: request.include_metadata,
            failure_policy: request.failure_policy,
            status: RetryJobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            success_count: 0,
            failure_count: 0,
            cursor: 0,
            error: None,
            skipped_image_ids: skipped,
        }
    }

    pub fn total(&self) -> usize {
        self.image_ids.len()
    }

    pub fn remaining(&self) -> &[ImageId] {
        self.image_ids.get(self.cursor..).unwrap_or(&[])
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.total()
    }

    /// Settings for one image: its stored settings or the batch override.
    pub fn effective_settings(&self, record: &ImageRecord) -> ProcessingSettings {
        match (&self.modified_settings, self.use_original_settings) {
            (Some(settings), false) => settings.clone(),
            _ => record.processing_settings.clone(),
        }
    }

    /// Mark job as owned by the worker. `started_at` keeps the first start.
    pub fn mark_processing(&mut self) {
        self.status = RetryJobStatus::Processing;
        self.started_at.get_or_insert_with(Utc::now);
    }

    /// Count one resolved image and advance the cursor.
    pub fn record(&mut self, outcome: ImageOutcome) {
        match outcome {
            ImageOutcome::Approved => self.success_count += 1,
            ImageOutcome::RetryFailed => self.failure_count += 1,
        }
        self.cursor += 1;
    }

    pub fn mark_completed(&mut self) {
        self.status = RetryJobStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RetryJobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Put an unfinished job back in the queue, keeping its cursor and counts.
    pub fn requeue(&mut self) {
        self.status = RetryJobStatus::Queued;
    }
}
