//! The routing message: one job attempt's work order.

use serde::{Deserialize, Serialize};

use segq_core::{ArtifactRef, DomainError, DomainResult, JobId, OwnerId};
use segq_events::{Event, Routable};

use crate::job::{Job, JobStatus};
use crate::method::{Method, SegmentationParams};

/// Bus source of job routing events.
pub const JOB_SOURCE: &str = "job-api";

/// Bus detail-type of job routing events.
pub const JOB_REQUESTED: &str = "JobRequested";

/// Everything a worker needs to execute one attempt without another metadata
/// lookup.
///
/// The idempotency token equals the job id: repeated delivery of the same job
/// must not repeat its side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingMessage {
    pub job_id: JobId,
    pub method: Method,
    pub params: SegmentationParams,
    pub idempotency_token: JobId,
    pub owner_id: OwnerId,
    pub input_ref: ArtifactRef,
    pub attempt: u32,
}

impl RoutingMessage {
    /// Validate `job` and build its work order.
    ///
    /// Fails with `DomainError::Validation` for an unknown method or params
    /// that do not satisfy the method's schema; nothing about the job changes.
    pub fn for_job(job: &Job) -> DomainResult<Self> {
        if job.status() != JobStatus::Queued {
            return Err(DomainError::invalid_transition(job.status().as_str(), "routed"));
        }
        let method: Method = job.method().parse()?;
        let params = SegmentationParams::parse(method, job.params())?;

        Ok(Self {
            job_id: job.id_typed(),
            method,
            params,
            idempotency_token: job.id_typed(),
            owner_id: job.owner_id().clone(),
            input_ref: job.input_ref().clone(),
            attempt: job.attempt(),
        })
    }

    /// Storage key for the attempt's result preview.
    pub fn result_key(&self) -> String {
        format!("results/{}/{}/preview.png", self.owner_id, self.job_id)
    }
}

impl Event for RoutingMessage {
    fn detail_type(&self) -> &'static str {
        JOB_REQUESTED
    }

    fn version(&self) -> u32 {
        1
    }
}

impl Routable for RoutingMessage {
    type Key = Method;

    fn routing_key(&self) -> Method {
        self.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use chrono::Utc;
    use serde_json::json;

    fn job(method: &str, params: serde_json::Value) -> Job {
        Job::new(
            JobId::new(42),
            NewJob {
                owner_id: OwnerId::new("bob").unwrap(),
                input_ref: ArtifactRef::new("uploads/bob/1.png").unwrap(),
                method: method.to_string(),
                params,
            },
            Utc::now(),
        )
    }

    #[test]
    fn builds_work_order_with_idempotency_token() {
        let msg = RoutingMessage::for_job(&job("sam", json!({ "repeat": 3 }))).unwrap();
        assert_eq!(msg.job_id, JobId::new(42));
        assert_eq!(msg.idempotency_token, msg.job_id);
        assert_eq!(msg.method, Method::Sam);
        assert_eq!(msg.params.repeat, 3);
        assert_eq!(msg.attempt, 1);
        assert_eq!(msg.routing_key(), Method::Sam);
        assert_eq!(msg.result_key(), "results/bob/42/preview.png");
    }

    #[test]
    fn unknown_method_is_a_validation_error() {
        let err = RoutingMessage::for_job(&job("watershed", json!({}))).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn wire_shape_carries_method_tag() {
        let msg = RoutingMessage::for_job(&job("grabcut", json!({}))).unwrap();
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["method"], "grabcut");
        assert_eq!(wire["idempotency_token"], 42);
        assert_eq!(wire["params"]["repeat"], 8);
    }
}
