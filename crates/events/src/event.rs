use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use qcretry_core::{ImageId, RetryJobId};

/// Subscription channel an event is delivered on.
///
/// Per-image completion rides on the `Progress` channel: observers that render
/// a progress bar want both the "started image N" tick and its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Progress,
    Completed,
    Error,
    QueueUpdated,
}

/// How one image's retry resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOutcome {
    Approved,
    RetryFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: RetryJobId,
    pub image_id: ImageId,
    /// Zero-based position of the image within the job.
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCompletedEvent {
    pub job_id: RetryJobId,
    pub image_id: ImageId,
    pub outcome: ImageOutcome,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletedEvent {
    pub job_id: RetryJobId,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Directory the retried images were written to, when configured.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorEvent {
    pub job_id: RetryJobId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdatedEvent {
    pub queue_length: usize,
    pub is_processing: bool,
}

/// Notification emitted by the retry queue and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum RetryEventPayload {
    Progress(ProgressEvent),
    ImageCompleted(ImageCompletedEvent),
    Completed(JobCompletedEvent),
    Error(JobErrorEvent),
    QueueUpdated(QueueUpdatedEvent),
}

/// Envelope: payload plus emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEvent {
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: RetryEventPayload,
}

impl RetryEvent {
    pub fn new(payload: RetryEventPayload) -> Self {
        Self {
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn progress(job_id: RetryJobId, image_id: ImageId, index: usize, total: usize) -> Self {
        Self::new(RetryEventPayload::Progress(ProgressEvent {
            job_id,
            image_id,
            index,
            total,
        }))
    }

    pub fn image_completed(
        job_id: RetryJobId,
        image_id: ImageId,
        outcome: ImageOutcome,
        reason: Option<String>,
    ) -> Self {
        Self::new(RetryEventPayload::ImageCompleted(ImageCompletedEvent {
            job_id,
            image_id,
            outcome,
            reason,
        }))
    }

    pub fn queue_updated(queue_length: usize, is_processing: bool) -> Self {
        Self::new(RetryEventPayload::QueueUpdated(QueueUpdatedEvent {
            queue_length,
            is_processing,
        }))
    }

    pub fn error(job_id: RetryJobId, message: impl Into<String>) -> Self {
        Self::new(RetryEventPayload::Error(JobErrorEvent {
            job_id,
            message: message.into(),
        }))
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            RetryEventPayload::Progress(_) | RetryEventPayload::ImageCompleted(_) => {
                EventKind::Progress
            }
            RetryEventPayload::Completed(_) => EventKind::Completed,
            RetryEventPayload::Error(_) => EventKind::Error,
            RetryEventPayload::QueueUpdated(_) => EventKind::QueueUpdated,
        }
    }

    /// Stable event name (e.g. "retry.image.completed").
    pub fn event_type(&self) -> &'static str {
        match &self.payload {
            RetryEventPayload::Progress(_) => "retry.progress",
            RetryEventPayload::ImageCompleted(_) => "retry.image.completed",
            RetryEventPayload::Completed(_) => "retry.job.completed",
            RetryEventPayload::Error(_) => "retry.job.error",
            RetryEventPayload::QueueUpdated(_) => "retry.queue.updated",
        }
    }

    pub fn job_id(&self) -> Option<RetryJobId> {
        match &self.payload {
            RetryEventPayload::Progress(e) => Some(e.job_id),
            RetryEventPayload::ImageCompleted(e) => Some(e.job_id),
            RetryEventPayload::Completed(e) => Some(e.job_id),
            RetryEventPayload::Error(e) => Some(e.job_id),
            RetryEventPayload::QueueUpdated(_) => None,
        }
    }
}
