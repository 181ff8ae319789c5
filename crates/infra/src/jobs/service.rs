//! Job control surface: submission, routing, admin requeue, deletion and
//! dead-letter administration.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use segq_core::{AggregateRoot, DomainError, ExpectedVersion, JobId};
use segq_events::EventBus;
use segq_jobs::{Job, JobStatus, Method, NewJob, RoutingMessage};

use super::router::{JobRouter, RouterError, RoutingOutcome, RoutingTable};
use super::store::{JobStats, JobStore, JobStoreError};
use crate::queue::{QueueError, QueuedMessage, ReceivedMessage, WorkQueue};

/// Error detail recorded when an operator discards a running job's work order.
pub const DISCARDED_DETAIL: &str = "discarded from dead-letter queue";

/// Concurrent writers get this many reload-and-retry rounds.
const MAX_SAVE_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("job {0} kept changing underneath the request")]
    Contended(JobId),
}

impl ServiceError {
    /// Unknown method or bad params; the job was left `queued` and unrouted.
    pub fn is_validation(&self) -> bool {
        match self {
            ServiceError::Domain(e) => e.is_validation(),
            ServiceError::Router(e) => e.is_validation(),
            _ => false,
        }
    }
}

/// Result of `start_job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Routed(RoutingOutcome),
    /// The current attempt already has a work order in flight.
    AlreadyRouted,
    /// A worker has claimed the job, or it has already finished.
    AlreadyStarted(JobStatus),
}

/// Result of `requeue_job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The job was reset (or was queued without a route) and routed afresh.
    Routed(RoutingOutcome),
    /// The job is already queued with a work order; nothing changed.
    AlreadyQueued,
}

/// What a dead-letter admin action did with the oldest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    /// The job was reset and routed as a new attempt.
    Requeued(RoutingOutcome),
    /// The job was reset but could not be routed; it waits in `queued`.
    Reset { job_id: JobId, reason: String },
    /// The message was removed. `abandoned` means a running job was marked
    /// `error`; `released` means a never-claimed job lost its route
    /// reservation and can be started again.
    Discarded {
        job_id: JobId,
        abandoned: bool,
        released: bool,
    },
    /// The message referred to a deleted job or a superseded attempt.
    Dropped { job_id: JobId, reason: &'static str },
}

/// A dead-lettered work order next to the current state of its job.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub message: QueuedMessage<RoutingMessage>,
    /// `None` when the job has been deleted.
    pub job_status: Option<JobStatus>,
    pub job_attempt: Option<u32>,
    pub error_detail: Option<String>,
}

impl DeadLetterEntry {
    /// Whether the work order still belongs to the job's current attempt.
    pub fn is_current(&self) -> bool {
        self.job_attempt == Some(self.message.body.attempt)
    }
}

/// Job lifecycle operations over a store and a router.
pub struct JobService<S, B> {
    store: S,
    router: JobRouter<B>,
    routes: RoutingTable,
}

impl<S, B> JobService<S, B>
where
    S: JobStore,
    B: EventBus<RoutingMessage>,
{
    pub fn new(store: S, router: JobRouter<B>, routes: RoutingTable) -> Self {
        Self {
            store,
            router,
            routes,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// Record a new job in `queued`. Nothing is routed yet.
    pub fn create_job(&self, new: NewJob) -> Result<JobId, ServiceError> {
        let job = self.store.create(new)?;
        info!(job_id = %job.id_typed(), owner_id = %job.owner_id(), method = job.method(), "job created");
        Ok(job.id_typed())
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, ServiceError> {
        self.store.get(job_id)?.ok_or(ServiceError::NotFound(job_id))
    }

    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.list_by_status(status, limit)?)
    }

    pub fn stats(&self) -> Result<JobStats, ServiceError> {
        Ok(self.store.stats()?)
    }

    /// Route the job's current attempt unless it already has a work order.
    ///
    /// A validation failure leaves the job `queued` and unrouted. A job past
    /// `queued` is left alone.
    pub async fn start_job(&self, job_id: JobId) -> Result<StartOutcome, ServiceError> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let job = self.get_job(job_id)?;
            if job.status() != JobStatus::Queued {
                return Ok(StartOutcome::AlreadyStarted(job.status()));
            }
            let job = if job.is_routed() {
                if self.has_work_order(&job).await? {
                    return Ok(StartOutcome::AlreadyRouted);
                }
                match self.release_stale_route(job) {
                    Err(ServiceError::Store(JobStoreError::VersionConflict { .. })) => continue,
                    released => released?,
                }
            } else {
                job
            };
            match self.route(job).await {
                Err(ServiceError::Store(JobStoreError::VersionConflict { .. })) => continue,
                other => return other.map(StartOutcome::Routed),
            }
        }
        Err(ServiceError::Contended(job_id))
    }

    /// Admin reset: send a `running`, `done` or `error` job back through the
    /// pipeline as a new attempt.
    ///
    /// Idempotent in effect: requeuing a job that is already queued with a work
    /// order changes nothing, so repeated calls never stack messages. A queued
    /// job whose reservation has no work order left is routed as a new attempt.
    pub async fn requeue_job(&self, job_id: JobId) -> Result<RequeueOutcome, ServiceError> {
        for _ in 0..MAX_SAVE_ATTEMPTS {
            let mut job = self.get_job(job_id)?;
            if job.status() == JobStatus::Queued {
                if job.is_routed() {
                    if self.has_work_order(&job).await? {
                        return Ok(RequeueOutcome::AlreadyQueued);
                    }
                    job = match self.release_stale_route(job) {
                        Err(ServiceError::Store(JobStoreError::VersionConflict { .. })) => continue,
                        released => released?,
                    };
                }
            } else {
                let base = job.version();
                let from = job.status();
                job.requeue()?;
                match self.store.save(&job, ExpectedVersion::Exact(base)) {
                    Err(JobStoreError::VersionConflict { .. }) => continue,
                    saved => saved?,
                }
                info!(job_id = %job_id, from = %from, attempt = job.attempt(), "job requeued");
            }

            match self.route(job).await {
                Err(ServiceError::Store(JobStoreError::VersionConflict { .. })) => continue,
                other => return other.map(RequeueOutcome::Routed),
            }
        }
        Err(ServiceError::Contended(job_id))
    }

    /// Delete a job. Rejected while it is running.
    pub fn delete_job(&self, job_id: JobId) -> Result<(), ServiceError> {
        match self.store.delete(job_id) {
            Err(JobStoreError::NotFound(id)) => Err(ServiceError::NotFound(id)),
            other => {
                other?;
                info!(job_id = %job_id, "job deleted");
                Ok(())
            }
        }
    }

    /// Inspect up to `max` dead-lettered work orders for `method`, each with
    /// the current state of its job.
    pub async fn list_dead_letters(
        &self,
        method: Method,
        max: usize,
    ) -> Result<Vec<DeadLetterEntry>, ServiceError> {
        let messages = self.routes.for_method(method).dead_letter.peek(max).await?;
        messages
            .into_iter()
            .map(|message| -> Result<DeadLetterEntry, ServiceError> {
                let job = self.store.get(message.body.job_id)?;
                Ok(DeadLetterEntry {
                    job_status: job.as_ref().map(Job::status),
                    job_attempt: job.as_ref().map(Job::attempt),
                    error_detail: job.as_ref().and_then(|j| j.error_detail().map(str::to_string)),
                    message,
                })
            })
            .collect()
    }

    /// Take the oldest dead-lettered work order for `method` and run its job
    /// again from scratch. `None` when the dead-letter queue is empty.
    pub async fn requeue_dead_letter(
        &self,
        method: Method,
    ) -> Result<Option<DeadLetterOutcome>, ServiceError> {
        let dlq = &self.routes.for_method(method).dead_letter;
        let Some(message) = dlq.receive(std::time::Duration::ZERO).await? else {
            return Ok(None);
        };

        let reset = match self.reset_dead_lettered(&message.body) {
            Ok(reset) => reset,
            Err(e) => {
                // Leave the work order where it was for the next attempt.
                dlq.change_visibility(&message.receipt, std::time::Duration::ZERO).await?;
                return Err(e);
            }
        };
        dlq.delete(&message.receipt).await?;

        let job = match reset {
            Ok(job) => job,
            Err(dropped) => return Ok(Some(dropped)),
        };
        let job_id = job.id_typed();
        match self.route(job).await {
            Ok(outcome) => Ok(Some(DeadLetterOutcome::Requeued(outcome))),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "dead-lettered job reset but not routed");
                Ok(Some(DeadLetterOutcome::Reset {
                    job_id,
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Remove the oldest dead-lettered work order for `method`. A job still
    /// `running` under that attempt is marked `error`; one still `queued`
    /// under it loses its route reservation.
    pub async fn discard_dead_letter(
        &self,
        method: Method,
    ) -> Result<Option<DeadLetterOutcome>, ServiceError> {
        let dlq = &self.routes.for_method(method).dead_letter;
        let Some(message) = dlq.receive(std::time::Duration::ZERO).await? else {
            return Ok(None);
        };

        let outcome = match self.abandon_dead_lettered(&message) {
            Ok(outcome) => outcome,
            Err(e) => {
                dlq.change_visibility(&message.receipt, std::time::Duration::ZERO).await?;
                return Err(e);
            }
        };
        dlq.delete(&message.receipt).await?;
        Ok(Some(outcome))
    }

    /// Reserve the route on the job record, then publish. The reservation is
    /// rolled back when the publish fails.
    async fn route(&self, mut job: Job) -> Result<RoutingOutcome, ServiceError> {
        let message = self.router.prepare(&job)?;

        let base = job.version();
        job.mark_routed()?;
        self.store.save(&job, ExpectedVersion::Exact(base))?;

        match self.router.dispatch(message).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let reserved = job.version();
                job.clear_routed();
                if let Err(rollback) = self.store.save(&job, ExpectedVersion::Exact(reserved)) {
                    warn!(job_id = %job.id_typed(), error = %rollback, "failed to release route reservation");
                }
                Err(e.into())
            }
        }
    }

    /// Whether the job's current attempt still has a message in its work or
    /// dead-letter queue, in flight or not.
    async fn has_work_order(&self, job: &Job) -> Result<bool, ServiceError> {
        let Ok(method) = job.method().parse::<Method>() else {
            return Ok(false);
        };
        let pair = self.routes.for_method(method);
        let (job_id, attempt) = (job.id_typed(), job.attempt());
        let matches = move |m: &RoutingMessage| m.job_id == job_id && m.attempt == attempt;
        Ok(pair.work.any(&matches).await? || pair.dead_letter.any(&matches).await?)
    }

    /// Drop a reservation whose work order is gone by moving the job to a
    /// fresh, unrouted attempt.
    fn release_stale_route(&self, mut job: Job) -> Result<Job, ServiceError> {
        let base = job.version();
        let stale_attempt = job.attempt();
        job.restart_routing()?;
        self.store.save(&job, ExpectedVersion::Exact(base))?;
        warn!(
            job_id = %job.id_typed(),
            stale_attempt,
            attempt = job.attempt(),
            "route reservation had no work order; routing a new attempt"
        );
        Ok(job)
    }

    /// Reset the job behind a dead-lettered work order. The inner `Err` says
    /// why the message is dropped instead.
    fn reset_dead_lettered(
        &self,
        message: &RoutingMessage,
    ) -> Result<Result<Job, DeadLetterOutcome>, ServiceError> {
        let job_id = message.job_id;
        let Some(mut job) = self.store.get(job_id)? else {
            return Ok(Err(DeadLetterOutcome::Dropped {
                job_id,
                reason: "job no longer exists",
            }));
        };
        if job.attempt() != message.attempt {
            return Ok(Err(DeadLetterOutcome::Dropped {
                job_id,
                reason: "attempt superseded",
            }));
        }

        let base = job.version();
        if job.status() == JobStatus::Queued {
            job.restart_routing()?;
        } else {
            job.requeue()?;
        }
        self.store.save(&job, ExpectedVersion::Exact(base))?;
        info!(job_id = %job_id, attempt = job.attempt(), "dead-lettered job requeued");
        Ok(Ok(job))
    }

    fn abandon_dead_lettered(
        &self,
        message: &ReceivedMessage<RoutingMessage>,
    ) -> Result<DeadLetterOutcome, ServiceError> {
        let job_id = message.body.job_id;
        let Some(mut job) = self.store.get(job_id)? else {
            return Ok(DeadLetterOutcome::Discarded {
                job_id,
                abandoned: false,
                released: false,
            });
        };

        let current = job.attempt() == message.body.attempt;
        let abandoned = current && job.status() == JobStatus::Running;
        let released = current && job.status() == JobStatus::Queued && job.is_routed();
        if abandoned || released {
            let base = job.version();
            if abandoned {
                job.abandon(DISCARDED_DETAIL, Utc::now())?;
            } else {
                job.clear_routed();
            }
            self.store.save(&job, ExpectedVersion::Exact(base))?;
        }
        warn!(
            job_id = %job_id,
            receive_count = message.receive_count,
            abandoned,
            released,
            "dead-lettered work order discarded"
        );
        Ok(DeadLetterOutcome::Discarded {
            job_id,
            abandoned,
            released,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use segq_core::{ArtifactRef, LeaseToken, OwnerId};
    use segq_events::InMemoryEventBus;
    use serde_json::json;

    use crate::jobs::router::QueuePair;
    use crate::jobs::store::InMemoryJobStore;
    use crate::queue::{InMemoryWorkQueue, QueueConfig, WorkQueue};

    type Queue = Arc<InMemoryWorkQueue<RoutingMessage>>;

    struct Harness {
        service: JobService<Arc<InMemoryJobStore>, Arc<InMemoryEventBus<RoutingMessage>>>,
        sam: Queue,
        sam_dlq: Queue,
    }

    fn pair(name: &str) -> (QueuePair, Queue, Queue) {
        let dlq = Arc::new(InMemoryWorkQueue::new(format!("{name}-dlq"), QueueConfig::default()));
        let work = Arc::new(InMemoryWorkQueue::with_dead_letter(
            name,
            QueueConfig::default(),
            dlq.clone(),
        ));
        let pair = QueuePair {
            work: work.clone(),
            dead_letter: dlq.clone(),
        };
        (pair, work, dlq)
    }

    fn harness() -> Harness {
        let (grabcut, _, _) = pair("grabcut");
        let (sam_pair, sam, sam_dlq) = pair("sam");
        let routes = RoutingTable::new(grabcut, sam_pair);
        let bus = Arc::new(InMemoryEventBus::new());
        routes.install(&bus).unwrap();
        Harness {
            service: JobService::new(InMemoryJobStore::arc(), JobRouter::new(bus), routes),
            sam,
            sam_dlq,
        }
    }

    fn sam_job() -> NewJob {
        NewJob {
            owner_id: OwnerId::new("dave").unwrap(),
            input_ref: ArtifactRef::new("uploads/dave/cat.png").unwrap(),
            method: "sam".to_string(),
            params: json!({ "repeat": 4 }),
        }
    }

    /// Drive the job through a worker's claim and completion.
    fn finish(h: &Harness, job_id: JobId) {
        let store = h.service.store();
        let mut job = store.get(job_id).unwrap().unwrap();
        let base = job.version();
        let lease = LeaseToken::new();
        job.start(lease, Utc::now()).unwrap();
        job.complete(lease, ArtifactRef::new("results/dave/1/preview.png").unwrap(), Utc::now())
            .unwrap();
        store.save(&job, ExpectedVersion::Exact(base)).unwrap();
    }

    fn finish_claimed(h: &Harness, job_id: JobId) {
        let store = h.service.store();
        let mut job = store.get(job_id).unwrap().unwrap();
        let base = job.version();
        let lease = job.lease().unwrap();
        job.complete(lease, ArtifactRef::new("results/dave/1/preview.png").unwrap(), Utc::now())
            .unwrap();
        store.save(&job, ExpectedVersion::Exact(base)).unwrap();
    }

    #[tokio::test]
    async fn start_routes_once() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();

        assert!(matches!(h.service.start_job(id).await.unwrap(), StartOutcome::Routed(_)));
        assert_eq!(h.service.start_job(id).await.unwrap(), StartOutcome::AlreadyRouted);
        assert_eq!(h.sam.metrics().await.unwrap().visible, 1);
        assert!(h.service.get_job(id).unwrap().is_routed());
    }

    #[tokio::test]
    async fn validation_failure_leaves_job_queued_and_unrouted() {
        let h = harness();
        let id = h
            .service
            .create_job(NewJob {
                method: "watershed".to_string(),
                ..sam_job()
            })
            .unwrap();

        let err = h.service.start_job(id).await.unwrap_err();
        assert!(err.is_validation());

        let job = h.service.get_job(id).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(!job.is_routed());
    }

    #[tokio::test]
    async fn repeated_requeue_of_done_job_routes_once() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        h.service.start_job(id).await.unwrap();
        let first = h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
        h.sam.delete(&first.receipt).await.unwrap();
        finish(&h, id);

        assert!(matches!(h.service.requeue_job(id).await.unwrap(), RequeueOutcome::Routed(_)));
        assert_eq!(h.service.requeue_job(id).await.unwrap(), RequeueOutcome::AlreadyQueued);

        let job = h.service.get_job(id).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.attempt(), 2);
        assert!(job.result_ref().is_none());
        assert_eq!(h.sam.metrics().await.unwrap().backlog(), 1);
    }

    #[tokio::test]
    async fn requeue_of_unrouted_queued_job_routes_it() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        assert!(matches!(h.service.requeue_job(id).await.unwrap(), RequeueOutcome::Routed(_)));
        assert_eq!(h.service.get_job(id).unwrap().attempt(), 1);
    }

    #[tokio::test]
    async fn running_job_cannot_be_deleted() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        let store = h.service.store();
        let mut job = store.get(id).unwrap().unwrap();
        let base = job.version();
        job.start(LeaseToken::new(), Utc::now()).unwrap();
        store.save(&job, ExpectedVersion::Exact(base)).unwrap();

        assert!(matches!(
            h.service.delete_job(id),
            Err(ServiceError::Store(JobStoreError::Running(_)))
        ));
        assert!(matches!(
            h.service.delete_job(JobId::new(999)),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_requeue_starts_new_attempt() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        h.service.start_job(id).await.unwrap();

        for _ in 0..2 {
            h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
            tokio::time::advance(QueueConfig::default().visibility_timeout).await;
        }
        assert!(h.sam.receive(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(h.service.list_dead_letters(Method::Sam, 10).await.unwrap().len(), 1);

        let outcome = h.service.requeue_dead_letter(Method::Sam).await.unwrap().unwrap();
        assert!(matches!(outcome, DeadLetterOutcome::Requeued(ref o) if o.attempt == 2));
        assert_eq!(h.sam_dlq.metrics().await.unwrap().backlog(), 0);

        let msg = h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(msg.body.attempt, 2);
        assert_eq!(msg.receive_count, 1);
        assert!(h.service.requeue_dead_letter(Method::Sam).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn discarding_running_job_marks_it_error() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        h.service.start_job(id).await.unwrap();

        // A worker claims the job and then hangs until the message dead-letters.
        let store = h.service.store();
        let mut job = store.get(id).unwrap().unwrap();
        let base = job.version();
        job.start(LeaseToken::new(), Utc::now()).unwrap();
        store.save(&job, ExpectedVersion::Exact(base)).unwrap();
        for _ in 0..2 {
            h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
            tokio::time::advance(QueueConfig::default().visibility_timeout).await;
        }
        h.sam.receive(Duration::ZERO).await.unwrap();

        let dead = h.service.list_dead_letters(Method::Sam, 10).await.unwrap();
        assert_eq!(dead[0].job_status, Some(JobStatus::Running));
        assert!(dead[0].is_current());

        let outcome = h.service.discard_dead_letter(Method::Sam).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            DeadLetterOutcome::Discarded {
                job_id: id,
                abandoned: true,
                released: false,
            }
        );
        let job = h.service.get_job(id).unwrap();
        assert_eq!(job.status(), JobStatus::Error);
        assert_eq!(job.error_detail(), Some(DISCARDED_DETAIL));
    }

    #[tokio::test]
    async fn start_after_claim_leaves_job_alone() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        h.service.start_job(id).await.unwrap();

        let store = h.service.store();
        let mut job = store.get(id).unwrap().unwrap();
        let base = job.version();
        job.start(LeaseToken::new(), Utc::now()).unwrap();
        store.save(&job, ExpectedVersion::Exact(base)).unwrap();

        assert_eq!(
            h.service.start_job(id).await.unwrap(),
            StartOutcome::AlreadyStarted(JobStatus::Running)
        );
        finish_claimed(&h, id);
        assert_eq!(
            h.service.start_job(id).await.unwrap(),
            StartOutcome::AlreadyStarted(JobStatus::Done)
        );
        assert_eq!(h.sam.metrics().await.unwrap().backlog(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn discarding_unclaimed_job_lets_it_be_started_again() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        h.service.start_job(id).await.unwrap();

        // Delivered twice, never claimed.
        for _ in 0..2 {
            h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
            tokio::time::advance(QueueConfig::default().visibility_timeout).await;
        }
        assert!(h.sam.receive(Duration::ZERO).await.unwrap().is_none());

        let dead = h.service.list_dead_letters(Method::Sam, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_status, Some(JobStatus::Queued));
        assert_eq!(dead[0].error_detail, None);

        let outcome = h.service.discard_dead_letter(Method::Sam).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            DeadLetterOutcome::Discarded {
                job_id: id,
                abandoned: false,
                released: true,
            }
        );
        let job = h.service.get_job(id).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert!(!job.is_routed());

        assert!(matches!(h.service.start_job(id).await.unwrap(), StartOutcome::Routed(_)));
        assert_eq!(h.sam.metrics().await.unwrap().visible, 1);
        assert_eq!(h.sam_dlq.metrics().await.unwrap().backlog(), 0);
    }

    #[tokio::test]
    async fn reservation_without_work_order_is_routed_as_new_attempt() {
        let h = harness();
        let id = h.service.create_job(sam_job()).unwrap();
        h.service.start_job(id).await.unwrap();

        // The work order is consumed without the job ever being claimed.
        let lost = h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
        h.sam.delete(&lost.receipt).await.unwrap();
        assert!(h.service.get_job(id).unwrap().is_routed());

        let RequeueOutcome::Routed(outcome) = h.service.requeue_job(id).await.unwrap() else {
            panic!("stale reservation was not routed");
        };
        assert_eq!(outcome.attempt, 2);
        assert_eq!(h.service.requeue_job(id).await.unwrap(), RequeueOutcome::AlreadyQueued);
        assert_eq!(h.service.start_job(id).await.unwrap(), StartOutcome::AlreadyRouted);

        let msg = h.sam.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(msg.body.attempt, 2);
        assert_eq!(h.sam.metrics().await.unwrap().backlog(), 1);
    }
}
