//! Worker execution loop: receive, claim, execute, record, acknowledge.
//!
//! ## Protocol
//!
//! 1. Long-poll the queue for one work order.
//! 2. Claim it: stamp a fresh lease on the job and move it to `running`
//!    (versioned save) before any expensive work.
//! 3. Run the segmenter, optionally extending the visibility window on a
//!    heartbeat.
//! 4. Record `done` / `error`, compare-and-set on the lease.
//! 5. Only then delete the message. A crash anywhere before this point leaves
//!    the message to be redelivered.
//!
//! Messages for a finished attempt, a superseded attempt or a deleted job are
//! acknowledged without side effects.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use segq_core::{AggregateRoot, ArtifactRef, ExpectedVersion, JobId, LeaseToken};
use segq_jobs::{ExecutionError, JobStatus, RoutingMessage, StartKind};

use super::segmenter::Segmenter;
use crate::jobs::{JobStore, JobStoreError};
use crate::queue::{QueueError, ReceivedMessage, WorkQueue, MAX_RECEIVE_WAIT};

/// Reload-and-retry rounds on a version conflict.
const MAX_SAVE_ATTEMPTS: usize = 3;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Long-poll wait per receive (capped at 20s)
    pub receive_wait: Duration,
    /// Window granted by each heartbeat extension
    pub visibility_timeout: Duration,
    /// Extend visibility this often while executing; `None` disables
    pub heartbeat: Option<Duration>,
    /// Pause after a failed receive
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            receive_wait: MAX_RECEIVE_WAIT,
            visibility_timeout: Duration::from_secs(300),
            heartbeat: None,
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait.min(MAX_RECEIVE_WAIT);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, every: Option<Duration>) -> Self {
        self.heartbeat = every.filter(|d| !d.is_zero());
        self
    }
}

/// What a worker did with one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Job recorded `done`; message deleted.
    Completed,
    /// Algorithm failed on valid input; job recorded `error`; message deleted.
    Failed,
    /// Transient trouble; message left (or made) visible for redelivery.
    Released,
    /// The attempt had already finished; message deleted.
    Duplicate,
    /// The job was requeued since this message was sent; message deleted.
    Superseded,
    /// Another claim took the job over mid-execution; nothing written, message
    /// left alone.
    StaleLease,
    /// The job no longer exists; message deleted.
    Orphaned,
}

impl Disposition {
    /// Whether the message is deleted.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Disposition::Released | Disposition::StaleLease)
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
    pub duplicates: u64,
    pub superseded: u64,
    pub stale_leases: u64,
    pub orphaned: u64,
}

impl WorkerStats {
    fn record(&mut self, disposition: Disposition) {
        self.received += 1;
        let counter = match disposition {
            Disposition::Completed => &mut self.completed,
            Disposition::Failed => &mut self.failed,
            Disposition::Released => &mut self.released,
            Disposition::Duplicate => &mut self.duplicates,
            Disposition::Superseded => &mut self.superseded,
            Disposition::StaleLease => &mut self.stale_leases,
            Disposition::Orphaned => &mut self.orphaned,
        };
        *counter += 1;
    }
}

enum Claim {
    Claimed(LeaseToken),
    Skip(Disposition),
}

/// A single-job-at-a-time consumer of one work queue.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue<RoutingMessage>>,
    store: Arc<dyn JobStore>,
    segmenter: Arc<dyn Segmenter>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue<RoutingMessage>>,
        store: Arc<dyn JobStore>,
        segmenter: Arc<dyn Segmenter>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            segmenter,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Share a stats accumulator (e.g. across a pool).
    pub fn with_stats(mut self, stats: Arc<Mutex<WorkerStats>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Receive and process until `shutdown` is notified.
    ///
    /// Shutdown interrupts a pending receive but never a running job.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(worker = %self.config.name, queue = self.queue.name(), "worker started");

        loop {
            let received = tokio::select! {
                _ = shutdown.notified() => break,
                received = self.queue.receive(self.config.receive_wait) => received,
            };

            match received {
                Ok(Some(message)) => {
                    self.handle(message).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = %self.config.name, error = %e, "receive failed");
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }

    /// One receive; `None` when the long poll came back empty.
    pub async fn poll_once(&self) -> Result<Option<Disposition>, QueueError> {
        match self.queue.receive(self.config.receive_wait).await? {
            Some(message) => Ok(Some(self.handle(message).await)),
            None => Ok(None),
        }
    }

    /// Process one received message end to end.
    pub async fn handle(&self, message: ReceivedMessage<RoutingMessage>) -> Disposition {
        let disposition = self.process(&message).await;

        if disposition.acknowledges() {
            self.ack(&message).await;
        }
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(disposition);

        debug!(
            worker = %self.config.name,
            job_id = %message.body.job_id,
            attempt = message.body.attempt,
            receive_count = message.receive_count,
            disposition = ?disposition,
            "message handled"
        );
        disposition
    }

    async fn process(&self, message: &ReceivedMessage<RoutingMessage>) -> Disposition {
        let order = &message.body;

        let lease = match self.claim(order) {
            Ok(Claim::Claimed(lease)) => lease,
            Ok(Claim::Skip(disposition)) => return disposition,
            Err(e) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %order.job_id,
                    error = %e,
                    "claim failed; releasing message"
                );
                self.release(message).await;
                return Disposition::Released;
            }
        };

        let outcome = self.execute(message).await;
        if let Err(e) = &outcome {
            warn!(worker = %self.config.name, job_id = %order.job_id, error = %e, "segmentation failed");
        }

        match self.commit(order.job_id, lease, outcome) {
            Ok(disposition) => disposition,
            Err(e) => {
                // Leave the message un-deleted: the window elapses and the job
                // is retried from scratch.
                error!(
                    worker = %self.config.name,
                    job_id = %order.job_id,
                    error = %e,
                    "failed to record outcome"
                );
                Disposition::Released
            }
        }
    }

    fn claim(&self, order: &RoutingMessage) -> Result<Claim, JobStoreError> {
        let job_id = order.job_id;

        for _ in 0..MAX_SAVE_ATTEMPTS {
            let Some(mut job) = self.store.get(job_id)? else {
                debug!(job_id = %job_id, "job deleted before execution");
                return Ok(Claim::Skip(Disposition::Orphaned));
            };
            if job.attempt() != order.attempt {
                debug!(
                    job_id = %job_id,
                    message_attempt = order.attempt,
                    job_attempt = job.attempt(),
                    "message superseded by requeue"
                );
                return Ok(Claim::Skip(Disposition::Superseded));
            }
            if job.status().is_terminal() {
                return Ok(Claim::Skip(Disposition::Duplicate));
            }

            let base = job.version();
            let lease = LeaseToken::new();
            let Ok(kind) = job.start(lease, Utc::now()) else {
                return Ok(Claim::Skip(Disposition::Duplicate));
            };

            match self.store.save(&job, ExpectedVersion::Exact(base)) {
                Ok(()) => {
                    if kind == StartKind::Takeover {
                        warn!(
                            worker = %self.config.name,
                            job_id = %job_id,
                            attempt = order.attempt,
                            "redelivered job taken over from a previous claim"
                        );
                    } else {
                        info!(worker = %self.config.name, job_id = %job_id, attempt = order.attempt, "job claimed");
                    }
                    return Ok(Claim::Claimed(lease));
                }
                Err(JobStoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(contended(job_id))
    }

    async fn execute(
        &self,
        message: &ReceivedMessage<RoutingMessage>,
    ) -> Result<ArtifactRef, ExecutionError> {
        let mut work = self.segmenter.segment(&message.body);
        let Some(every) = self.config.heartbeat else {
            return work.await;
        };

        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => {
                    match self
                        .queue
                        .change_visibility(&message.receipt, self.config.visibility_timeout)
                        .await
                    {
                        Ok(()) => debug!(job_id = %message.body.job_id, "visibility extended"),
                        Err(e) => warn!(job_id = %message.body.job_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }

    fn commit(
        &self,
        job_id: JobId,
        lease: LeaseToken,
        outcome: Result<ArtifactRef, ExecutionError>,
    ) -> Result<Disposition, JobStoreError> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let Some(mut job) = self.store.get(job_id)? else {
                return Ok(Disposition::Orphaned);
            };
            let base = job.version();
            let now = Utc::now();

            let (applied, disposition) = match &outcome {
                Ok(result) => (job.complete(lease, result.clone(), now), Disposition::Completed),
                Err(e) => (job.fail(lease, e.to_string(), now), Disposition::Failed),
            };
            if let Err(e) = applied {
                warn!(
                    worker = %self.config.name,
                    job_id = %job_id,
                    status = %job.status(),
                    error = %e,
                    "lease superseded; discarding result"
                );
                return Ok(Disposition::StaleLease);
            }

            match self.store.save(&job, ExpectedVersion::Exact(base)) {
                Ok(()) => {
                    match job.status() {
                        JobStatus::Done => info!(job_id = %job_id, attempt = job.attempt(), "job done"),
                        _ => info!(job_id = %job_id, attempt = job.attempt(), "job failed"),
                    }
                    return Ok(disposition);
                }
                Err(JobStoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(contended(job_id))
    }

    async fn ack(&self, message: &ReceivedMessage<RoutingMessage>) {
        if let Err(e) = self.queue.delete(&message.receipt).await {
            // The window elapsed and the message went out again; that copy
            // will find the attempt finished and be acked as a duplicate.
            warn!(job_id = %message.body.job_id, error = %e, "acknowledge failed");
        }
    }

    async fn release(&self, message: &ReceivedMessage<RoutingMessage>) {
        if let Err(e) = self.queue.change_visibility(&message.receipt, Duration::ZERO).await {
            warn!(job_id = %message.body.job_id, error = %e, "release failed");
        }
    }
}

fn contended(job_id: JobId) -> JobStoreError {
    JobStoreError::Storage(format!("job {job_id} kept changing during save"))
}
