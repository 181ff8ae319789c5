//! Job router: validates a queued job and publishes its work order.
//!
//! The router never talks to a queue directly. It publishes a `JobRequested`
//! envelope from `job-api`, and the bus's rule set decides which queue gets
//! it. The rules come from [`RoutingTable`], an exhaustive `Method -> queue`
//! map.

use std::sync::Arc;

use tracing::{debug, info};

use segq_core::{DomainError, JobId};
use segq_events::{BusError, EventBus, EventEnvelope, EventPattern, InMemoryEventBus};
use segq_jobs::{JOB_REQUESTED, JOB_SOURCE, Job, Method, RoutingMessage};

use crate::queue::{QueueTarget, WorkQueue};

/// A method's work queue and the dead-letter queue it redrives to.
#[derive(Clone)]
pub struct QueuePair {
    pub work: Arc<dyn WorkQueue<RoutingMessage>>,
    pub dead_letter: Arc<dyn WorkQueue<RoutingMessage>>,
}

/// One queue pair per method.
#[derive(Clone)]
pub struct RoutingTable {
    grabcut: QueuePair,
    sam: QueuePair,
}

impl RoutingTable {
    pub fn new(grabcut: QueuePair, sam: QueuePair) -> Self {
        Self { grabcut, sam }
    }

    pub fn for_method(&self, method: Method) -> &QueuePair {
        match method {
            Method::GrabCut => &self.grabcut,
            Method::Sam => &self.sam,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Method, &QueuePair)> {
        Method::ALL.into_iter().map(move |m| (m, self.for_method(m)))
    }

    /// Register one `(job-api, JobRequested, method) -> work queue` rule per
    /// method on `bus`.
    pub fn install(&self, bus: &InMemoryEventBus<RoutingMessage>) -> Result<(), BusError> {
        for (method, pair) in self.iter() {
            bus.add_rule(
                EventPattern::new(JOB_SOURCE, JOB_REQUESTED),
                method,
                Arc::new(QueueTarget::new(pair.work.clone())),
            )?;
        }
        Ok(())
    }
}

/// Where a work order went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingOutcome {
    pub job_id: JobId,
    pub attempt: u32,
    pub method: Method,
    pub queue: String,
    pub message_id: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    /// Unknown method, bad params, or a job that is not `queued`.
    #[error(transparent)]
    Rejected(#[from] DomainError),

    #[error("publish failed: {0}")]
    Publish(String),
}

impl RouterError {
    pub fn is_validation(&self) -> bool {
        matches!(self, RouterError::Rejected(e) if e.is_validation())
    }
}

/// Classifies jobs and hands them to the bus.
pub struct JobRouter<B> {
    bus: B,
}

impl<B> JobRouter<B>
where
    B: EventBus<RoutingMessage>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Validate and build the work order for `job` without sending anything.
    pub fn prepare(&self, job: &Job) -> Result<RoutingMessage, RouterError> {
        RoutingMessage::for_job(job).map_err(|e| {
            debug!(job_id = %job.id_typed(), method = job.method(), error = %e, "job rejected by router");
            RouterError::from(e)
        })
    }

    /// Publish a prepared work order. Exactly one queue receives it.
    pub async fn dispatch(&self, message: RoutingMessage) -> Result<RoutingOutcome, RouterError> {
        let job_id = message.job_id;
        let attempt = message.attempt;
        let method = message.method;

        let receipt = self
            .bus
            .publish(EventEnvelope::new(JOB_SOURCE, message))
            .await
            .map_err(|e| RouterError::Publish(e.to_string()))?;

        let version = receipt.version;
        let delivery = receipt
            .deliveries
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::Publish(format!("no target accepted job {job_id}")))?;

        info!(
            job_id = %job_id,
            attempt,
            method = %method,
            version,
            queue = %delivery.target,
            message_id = %delivery.message_id,
            "job routed"
        );

        Ok(RoutingOutcome {
            job_id,
            attempt,
            method,
            queue: delivery.target,
            message_id: delivery.message_id,
        })
    }

    /// `prepare` then `dispatch`.
    pub async fn submit(&self, job: &Job) -> Result<RoutingOutcome, RouterError> {
        let message = self.prepare(job)?;
        self.dispatch(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryWorkQueue, QueueConfig};
    use chrono::Utc;
    use segq_core::{ArtifactRef, OwnerId};
    use segq_jobs::NewJob;
    use serde_json::json;

    fn pair(name: &str) -> (QueuePair, Arc<InMemoryWorkQueue<RoutingMessage>>) {
        let dlq = Arc::new(InMemoryWorkQueue::new(format!("{name}-dlq"), QueueConfig::default()));
        let work = Arc::new(InMemoryWorkQueue::with_dead_letter(
            name,
            QueueConfig::default(),
            dlq.clone(),
        ));
        (
            QueuePair {
                work: work.clone(),
                dead_letter: dlq,
            },
            work,
        )
    }

    fn job(id: u64, method: &str, params: serde_json::Value) -> Job {
        Job::new(
            JobId::new(id),
            NewJob {
                owner_id: OwnerId::new("carol").unwrap(),
                input_ref: ArtifactRef::new("uploads/carol/x.png").unwrap(),
                method: method.to_string(),
                params,
            },
            Utc::now(),
        )
    }

    fn router() -> (
        JobRouter<Arc<InMemoryEventBus<RoutingMessage>>>,
        Arc<InMemoryWorkQueue<RoutingMessage>>,
        Arc<InMemoryWorkQueue<RoutingMessage>>,
    ) {
        let (grabcut, grabcut_q) = pair("grabcut");
        let (sam, sam_q) = pair("sam");
        let bus = Arc::new(InMemoryEventBus::new());
        RoutingTable::new(grabcut, sam).install(&bus).unwrap();
        (JobRouter::new(bus), grabcut_q, sam_q)
    }

    #[tokio::test]
    async fn each_method_lands_on_its_own_queue() {
        let (router, grabcut_q, sam_q) = router();

        let outcome = router.submit(&job(1, "sam", json!({}))).await.unwrap();
        assert_eq!(outcome.queue, "sam");
        assert_eq!(outcome.method, Method::Sam);
        router.submit(&job(2, "GrabCut", json!({ "gamma": 1.5 }))).await.unwrap();

        assert_eq!(sam_q.metrics().await.unwrap().visible, 1);
        assert_eq!(grabcut_q.metrics().await.unwrap().visible, 1);

        let sent = sam_q.peek(1).await.unwrap();
        assert_eq!(sent[0].body.job_id, JobId::new(1));
        assert_eq!(sent[0].body.idempotency_token, JobId::new(1));
    }

    #[tokio::test]
    async fn invalid_params_send_nothing() {
        let (router, grabcut_q, sam_q) = router();

        let err = router
            .submit(&job(3, "grabcut", json!({ "repeat": 65 })))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(grabcut_q.metrics().await.unwrap().backlog(), 0);
        assert_eq!(sam_q.metrics().await.unwrap().backlog(), 0);
    }

    #[tokio::test]
    async fn table_installs_one_rule_per_method() {
        let (grabcut, _) = pair("g");
        let (sam, _) = pair("s");
        let bus = InMemoryEventBus::new();
        RoutingTable::new(grabcut, sam).install(&bus).unwrap();
        assert_eq!(bus.rule_count(), Method::ALL.len());
    }
}
