//! Retry job storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use qcretry_core::RetryJobId;

use super::types::{RetryJob, RetryJobStatus};

/// Retry job store abstraction.
///
/// Ordering is the store's responsibility: `claim_next` hands out queued jobs
/// strictly in submission order, except that `requeue_front` puts a job ahead
/// of everything still queued.
pub trait RetryJobStore: Send + Sync {
    /// Add a newly submitted job at the tail of the queue.
    fn insert(&self, job: RetryJob) -> Result<(), RetryJobStoreError>;

    fn get(&self, job_id: RetryJobId) -> Result<Option<RetryJob>, RetryJobStoreError>;

    /// Replace a job's state (progress counts, status).
    fn update(&self, job: &RetryJob) -> Result<(), RetryJobStoreError>;

    /// Claim the oldest queued job and mark it processing.
    /// Returns None if the queue is empty or a job is already processing.
    fn claim_next(&self) -> Result<Option<RetryJob>, RetryJobStoreError>;

    /// Return an unfinished job to the head of the queue.
    fn requeue_front(&self, job: &RetryJob) -> Result<(), RetryJobStoreError>;

    /// All jobs in submission order.
    fn list(&self) -> Result<Vec<RetryJob>, RetryJobStoreError>;

    fn stats(&self) -> Result<RetryJobStats, RetryJobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryJobStoreError {
    #[error("retry job not found: {0}")]
    NotFound(RetryJobId),
    #[error("retry job already exists: {0}")]
    AlreadyExists(RetryJobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts by status, maintained incrementally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub current: Option<RetryJobId>,
}

impl RetryJobStats {
    fn add(&mut self, job: &RetryJob) {
        match job.status {
            RetryJobStatus::Queued => self.queued += 1,
            RetryJobStatus::Processing => {
                self.processing += 1;
                self.current = Some(job.id);
            }
            RetryJobStatus::Completed => self.completed += 1,
            RetryJobStatus::Failed => self.failed += 1,
        }
    }

    fn sub(&mut self, job: &RetryJob) {
        match job.status {
            RetryJobStatus::Queued => self.queued = self.queued.saturating_sub(1),
            RetryJobStatus::Processing => {
                self.processing = self.processing.saturating_sub(1);
                if self.current == Some(job.id) {
                    self.current = None;
                }
            }
            RetryJobStatus::Completed => self.completed = self.completed.saturating_sub(1),
            RetryJobStatus::Failed => self.failed = self.failed.saturating_sub(1),
        }
    }
}

#[derive(Debug)]
struct Entry {
    job: RetryJob,
    /// Submission order, for history listings.
    submitted: u64,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<RetryJobId, Entry>,
    /// Queue position → queued job. Head positions go negative on requeue.
    queue: BTreeMap<i64, RetryJobId>,
    next_submitted: u64,
    stats: RetryJobStats,
}

impl Inner {
    fn queue_position(&self, job_id: RetryJobId) -> Option<i64> {
        self.queue
            .iter()
            .find(|(_, id)| **id == job_id)
            .map(|(pos, _)| *pos)
    }

    fn replace(&mut self, job: RetryJob) -> Result<(), RetryJobStoreError> {
        let entry = self
            .jobs
            .get_mut(&job.id)
            .ok_or(RetryJobStoreError::NotFound(job.id))?;
        self.stats.sub(&entry.job);
        self.stats.add(&job);
        entry.job = job;
        Ok(())
    }
}

/// In-memory retry job store.
#[derive(Debug, Default)]
pub struct InMemoryRetryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryRetryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> RetryJobStoreError {
    RetryJobStoreError::Storage("retry job store lock poisoned".to_string())
}

impl RetryJobStore for InMemoryRetryJobStore {
    fn insert(&self, job: RetryJob) -> Result<(), RetryJobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.jobs.contains_key(&job.id) {
            return Err(RetryJobStoreError::AlreadyExists(job.id));
        }

        let submitted = inner.next_submitted;
        inner.next_submitted += 1;
        if job.status == RetryJobStatus::Queued {
            let pos = inner.queue.last_key_value().map_or(0, |(pos, _)| pos + 1);
            inner.queue.insert(pos, job.id);
        }
        inner.stats.add(&job);
        inner.jobs.insert(job.id, Entry { job, submitted });
        Ok(())
    }

    fn get(&self, job_id: RetryJobId) -> Result<Option<RetryJob>, RetryJobStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    fn update(&self, job: &RetryJob) -> Result<(), RetryJobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if job.status != RetryJobStatus::Queued {
            if let Some(pos) = inner.queue_position(job.id) {
                inner.queue.remove(&pos);
            }
        }
        inner.replace(job.clone())
    }

    fn claim_next(&self) -> Result<Option<RetryJob>, RetryJobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if inner.stats.processing > 0 {
            return Ok(None);
        }

        let Some((_, job_id)) = inner.queue.pop_first() else {
            return Ok(None);
        };
        let mut job = inner
            .jobs
            .get(&job_id)
            .map(|e| e.job.clone())
            .ok_or(RetryJobStoreError::NotFound(job_id))?;
        job.mark_processing();
        inner.replace(job.clone())?;
        Ok(Some(job))
    }

    fn requeue_front(&self, job: &RetryJob) -> Result<(), RetryJobStoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        if let Some(pos) = inner.queue_position(job.id) {
            inner.queue.remove(&pos);
        }

        let mut job = job.clone();
        job.requeue();
        inner.replace(job.clone())?;

        let head = inner.queue.first_key_value().map_or(0, |(pos, _)| pos - 1);
        inner.queue.insert(head, job.id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<RetryJob>, RetryJobStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by_key(|e| e.submitted);
        Ok(entries.into_iter().map(|e| e.job.clone()).collect())
    }

    fn stats(&self) -> Result<RetryJobStats, RetryJobStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.stats.clone())
    }
}

impl<S> RetryJobStore for Arc<S>
where
    S: RetryJobStore + ?Sized,
{
    fn insert(&self, job: RetryJob) -> Result<(), RetryJobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: RetryJobId) -> Result<Option<RetryJob>, RetryJobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &RetryJob) -> Result<(), RetryJobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self) -> Result<Option<RetryJob>, RetryJobStoreError> {
        (**self).claim_next()
    }

    fn requeue_front(&self, job: &RetryJob) -> Result<(), RetryJobStoreError> {
        (**self).requeue_front(job)
    }

    fn list(&self) -> Result<Vec<RetryJob>, RetryJobStoreError> {
        (**self).list()
    }

    fn stats(&self) -> Result<RetryJobStats, RetryJobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use qcretry_core::ImageId;
    use qcretry_events::ImageOutcome;

    use super::*;
    use crate::jobs::types::RetryRequest;

    fn job(id: &str) -> RetryJob {
        let ids = vec![ImageId::from(id)];
        RetryJob::new(RetryRequest::original(ids.clone()), ids, Vec::new())
    }

    #[test]
    fn claims_in_submission_order() {
        let store = InMemoryRetryJobStore::new();
        let first = job("a");
        let second = job("b");
        store.insert(first.clone()).unwrap();
        store.insert(second.clone()).unwrap();

        let mut claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, RetryJobStatus::Processing);

        // Single-job constraint
        assert!(store.claim_next().unwrap().is_none());

        claimed.record(ImageOutcome::Approved);
        claimed.mark_completed();
        store.update(&claimed).unwrap();

        assert_eq!(store.claim_next().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn stats_track_transitions() {
        let store = InMemoryRetryJobStore::new();
        store.insert(job("a")).unwrap();
        store.insert(job("b")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!((stats.queued, stats.processing), (2, 0));

        let mut claimed = store.claim_next().unwrap().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!((stats.queued, stats.processing), (1, 1));
        assert_eq!(stats.current, Some(claimed.id));

        claimed.mark_failed("store unavailable");
        store.update(&claimed).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!((stats.queued, stats.processing, stats.failed), (1, 0, 1));
        assert_eq!(stats.current, None);
    }

    #[test]
    fn requeue_front_jumps_the_queue() {
        let store = InMemoryRetryJobStore::new();
        let first = job("a");
        let second = job("b");
        store.insert(first.clone()).unwrap();
        store.insert(second).unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        store.requeue_front(&claimed).unwrap();

        assert_eq!(store.stats().unwrap().queued, 2);
        assert_eq!(store.claim_next().unwrap().unwrap().id, first.id);
    }

    #[test]
    fn list_keeps_submission_order() {
        let store = InMemoryRetryJobStore::new();
        let ids: Vec<_> = (0..5)
            .map(|i| {
                let j = job(&format!("img-{i}"));
                let id = j.id;
                store.insert(j).unwrap();
                id
            })
            .collect();

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn update_of_unknown_job_is_not_found() {
        let store = InMemoryRetryJobStore::new();
        let err = store.update(&job("a")).unwrap_err();
        assert!(matches!(err, RetryJobStoreError::NotFound(_)));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 128,
                ..ProptestConfig::default()
            })]

            /// Property: jobs are claimed in submission order and the incremental
            /// counters agree with the final job states.
            #[test]
            fn claims_are_fifo_and_stats_add_up(outcomes in prop::collection::vec(any::<bool>(), 1..20)) {
                let store = InMemoryRetryJobStore::new();
                let jobs: Vec<RetryJob> = (0..outcomes.len()).map(|i| job(&format!("img-{i}"))).collect();
                for j in &jobs {
                    store.insert(j.clone()).unwrap();
                }

                for (expected, succeed) in jobs.iter().zip(&outcomes) {
                    let mut claimed = store.claim_next().unwrap().unwrap();
                    prop_assert_eq!(claimed.id, expected.id);
                    if *succeed {
                        claimed.record(ImageOutcome::Approved);
                        claimed.mark_completed();
                    } else {
                        claimed.mark_failed("store unavailable");
                    }
                    store.update(&claimed).unwrap();
                }

                let stats = store.stats().unwrap();
                let completed = outcomes.iter().filter(|ok| **ok).count();
                prop_assert_eq!((stats.queued, stats.processing), (0, 0));
                prop_assert_eq!(stats.completed, completed);
                prop_assert_eq!(stats.failed, outcomes.len() - completed);
                prop_assert!(store.claim_next().unwrap().is_none());
            }
        }
    }
}
