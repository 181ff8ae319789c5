//! Job record storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use segq_core::{AggregateRoot, ExpectedVersion, JobId};
use segq_jobs::{Job, JobStatus, NewJob};

/// Job store abstraction.
///
/// Saves are compare-and-set on the aggregate version; this is what keeps two
/// concurrent writers (worker vs. worker, worker vs. admin) from clobbering
/// each other.
pub trait JobStore: Send + Sync {
    /// Record a new job in `queued` and assign its id.
    fn create(&self, new: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by id.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Persist `job` if the stored copy is still at `expected`.
    fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError>;

    /// Delete a job. Running jobs cannot be deleted.
    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// List jobs, oldest first.
    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Per-status counts.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} was modified concurrently (expected {expected:?}, found version {actual})")]
    VersionConflict {
        job_id: JobId,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("job {0} is running and cannot be deleted")]
    Running(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.done + self.error
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Error => self.error += 1,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    next_id: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job table lock poisoned".to_string())
}

impl JobStore for InMemoryJobStore {
    fn create(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let id = JobId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Job::new(id, new, Utc::now());

        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.insert(id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        let job_id = job.id_typed();
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let stored = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if !expected.matches(stored.version()) {
            return Err(JobStoreError::VersionConflict {
                job_id,
                expected,
                actual: stored.version(),
            });
        }
        *stored = job.clone();
        Ok(())
    }

    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.ensure_deletable().is_err() {
            return Err(JobStoreError::Running(job_id));
        }
        jobs.remove(&job_id);
        Ok(())
    }

    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status() == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.id_typed());
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status());
        }
        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn create(&self, new: NewJob) -> Result<Job, JobStoreError> {
        (**self).create(new)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn save(&self, job: &Job, expected: ExpectedVersion) -> Result<(), JobStoreError> {
        (**self).save(job, expected)
    }

    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(job_id)
    }

    fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segq_core::{ArtifactRef, LeaseToken, OwnerId};

    fn new_job() -> NewJob {
        NewJob {
            owner_id: OwnerId::new("alice").unwrap(),
            input_ref: ArtifactRef::new("uploads/alice/a.png").unwrap(),
            method: "grabcut".to_string(),
            params: serde_json::json!({}),
        }
    }

    #[test]
    fn ids_are_assigned_monotonically() {
        let store = InMemoryJobStore::new();
        let a = store.create(new_job()).unwrap();
        let b = store.create(new_job()).unwrap();
        assert!(b.id_typed() > a.id_typed());
        assert_eq!(a.status(), JobStatus::Queued);
    }

    #[test]
    fn stale_save_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job()).unwrap();
        let base = job.version();

        let mut first = job.clone();
        first.start(LeaseToken::new(), Utc::now()).unwrap();
        store.save(&first, ExpectedVersion::Exact(base)).unwrap();

        let mut second = job;
        second.start(LeaseToken::new(), Utc::now()).unwrap();
        let err = store.save(&second, ExpectedVersion::Exact(base)).unwrap_err();
        assert!(matches!(err, JobStoreError::VersionConflict { .. }));

        let stored = store.get(first.id_typed()).unwrap().unwrap();
        assert_eq!(stored.lease(), first.lease());
    }

    #[test]
    fn running_jobs_cannot_be_deleted() {
        let store = InMemoryJobStore::new();
        let mut job = store.create(new_job()).unwrap();
        let base = job.version();
        job.start(LeaseToken::new(), Utc::now()).unwrap();
        store.save(&job, ExpectedVersion::Exact(base)).unwrap();

        assert_eq!(
            store.delete(job.id_typed()),
            Err(JobStoreError::Running(job.id_typed()))
        );
        assert!(store.get(job.id_typed()).unwrap().is_some());
    }

    #[test]
    fn delete_removes_queued_job() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job()).unwrap();
        store.delete(job.id_typed()).unwrap();
        assert!(store.get(job.id_typed()).unwrap().is_none());
        assert_eq!(store.delete(job.id_typed()), Err(JobStoreError::NotFound(job.id_typed())));
    }

    #[test]
    fn list_and_stats_by_status() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.create(new_job()).unwrap();
        }
        let mut running = store.create(new_job()).unwrap();
        let base = running.version();
        running.start(LeaseToken::new(), Utc::now()).unwrap();
        store.save(&running, ExpectedVersion::Exact(base)).unwrap();

        let queued = store.list_by_status(Some(JobStatus::Queued), 2).unwrap();
        assert_eq!(queued.len(), 2);
        assert!(queued[0].id_typed() < queued[1].id_typed());

        let stats = store.stats().unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total(), 4);
    }
}
