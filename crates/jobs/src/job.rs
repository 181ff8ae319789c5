//! The job aggregate and its lifecycle.
//!
//! ```text
//! queued ──start──▶ running ──complete──▶ done
//!                      │  └──────fail──────▶ error
//!                      └─start (redelivery takeover, new lease)
//! {running, done, error} ──requeue (admin)──▶ queued   (attempt + 1)
//! ```
//!
//! Mutual exclusion between workers comes from the queue's visibility window,
//! not from this type. What the aggregate enforces is that a terminal write
//! carries the lease of the claim that is current, so a worker that lost its
//! message to a redelivery cannot overwrite the newer attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use segq_core::{AggregateRoot, ArtifactRef, DomainError, DomainResult, JobId, LeaseToken, OwnerId};

/// Error details longer than this are truncated before being recorded.
pub const MAX_ERROR_DETAIL_LEN: usize = 1024;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission payload for a new job.
///
/// `method` and `params` are kept raw: they are validated when the job is
/// routed, not when it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub owner_id: OwnerId,
    pub input_ref: ArtifactRef,
    pub method: String,
    pub params: serde_json::Value,
}

/// How a claim entered `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// `queued → running`.
    Fresh,
    /// The job was already running under a lease whose message became visible
    /// again; the new claim supersedes it.
    Takeover,
}

/// A segmentation job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    owner_id: OwnerId,
    input_ref: ArtifactRef,
    method: String,
    params: serde_json::Value,
    status: JobStatus,
    result_ref: Option<ArtifactRef>,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    /// Starts at 1; incremented by every requeue.
    attempt: u32,
    lease: Option<LeaseToken>,
    /// A routing message has been reserved for the current attempt.
    routed: bool,
    version: u64,
}

impl Job {
    /// Create a job in `queued`.
    pub fn new(id: JobId, new: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: new.owner_id,
            input_ref: new.input_ref,
            method: new.method,
            params: new.params,
            status: JobStatus::Queued,
            result_ref: None,
            error_detail: None,
            created_at,
            started_at: None,
            finished_at: None,
            attempt: 1,
            lease: None,
            routed: false,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> JobId {
        self.id
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn input_ref(&self) -> &ArtifactRef {
        &self.input_ref
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result_ref(&self) -> Option<&ArtifactRef> {
        self.result_ref.as_ref()
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn lease(&self) -> Option<LeaseToken> {
        self.lease
    }

    pub fn is_routed(&self) -> bool {
        self.routed
    }

    /// Reserve the routing message for the current attempt.
    pub fn mark_routed(&mut self) -> DomainResult<()> {
        if self.status != JobStatus::Queued {
            return Err(DomainError::invalid_transition(self.status.as_str(), "routed"));
        }
        if self.routed {
            return Err(DomainError::conflict(format!(
                "job {} attempt {} already routed",
                self.id, self.attempt
            )));
        }
        self.routed = true;
        self.touch();
        Ok(())
    }

    /// Undo a reservation whose publish failed.
    pub fn clear_routed(&mut self) {
        if self.status == JobStatus::Queued && self.routed {
            self.routed = false;
            self.touch();
        }
    }

    /// Claim the job for execution under `lease`.
    pub fn start(&mut self, lease: LeaseToken, now: DateTime<Utc>) -> DomainResult<StartKind> {
        let kind = match self.status {
            JobStatus::Queued => StartKind::Fresh,
            JobStatus::Running => StartKind::Takeover,
            JobStatus::Done | JobStatus::Error => {
                return Err(DomainError::invalid_transition(self.status.as_str(), "running"));
            }
        };
        self.status = JobStatus::Running;
        self.lease = Some(lease);
        self.started_at = Some(now);
        self.touch();
        Ok(kind)
    }

    /// `running → done`, only for the current lease.
    pub fn complete(
        &mut self,
        lease: LeaseToken,
        result_ref: ArtifactRef,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_current_lease(lease, JobStatus::Done)?;
        self.status = JobStatus::Done;
        self.result_ref = Some(result_ref);
        self.error_detail = None;
        self.finished_at = Some(now);
        self.lease = None;
        self.routed = false;
        self.touch();
        Ok(())
    }

    /// `running → error`, only for the current lease.
    pub fn fail(
        &mut self,
        lease: LeaseToken,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_current_lease(lease, JobStatus::Error)?;
        self.record_error(detail.into(), now)
    }

    /// `running → error` without a lease (operator discarded the work order).
    pub fn abandon(&mut self, detail: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Running {
            return Err(DomainError::invalid_transition(self.status.as_str(), "error"));
        }
        self.record_error(detail.into(), now)
    }

    /// Administrative reset: `{running, done, error} → queued`.
    ///
    /// Starts a new attempt from scratch; any in-flight lease is revoked.
    pub fn requeue(&mut self) -> DomainResult<()> {
        if self.status == JobStatus::Queued {
            return Err(DomainError::invalid_transition("queued", "queued"));
        }
        self.status = JobStatus::Queued;
        self.reset_attempt();
        Ok(())
    }

    /// Start a new attempt for a job that never left `queued` (its work order
    /// was dead-lettered before any worker could claim it).
    pub fn restart_routing(&mut self) -> DomainResult<()> {
        if self.status != JobStatus::Queued {
            return Err(DomainError::invalid_transition(self.status.as_str(), "queued"));
        }
        self.reset_attempt();
        Ok(())
    }

    /// Jobs may not be destroyed while a worker holds them.
    pub fn ensure_deletable(&self) -> DomainResult<()> {
        if self.status == JobStatus::Running {
            return Err(DomainError::conflict(format!("job {} is running", self.id)));
        }
        Ok(())
    }

    /// Check the record-level invariants that must hold at every observed point.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let fail = |msg: &str| Err(DomainError::invariant(format!("job {}: {msg}", self.id)));

        if self.result_ref.is_some() != (self.status == JobStatus::Done) {
            return fail("result_ref must be set iff status is done");
        }
        if self.error_detail.is_some() != (self.status == JobStatus::Error) {
            return fail("error_detail must be set iff status is error");
        }
        if self.started_at.is_some() == (self.status == JobStatus::Queued) {
            return fail("started_at must be set iff the attempt left queued");
        }
        if self.finished_at.is_some() != self.status.is_terminal() {
            return fail("finished_at must be set iff status is terminal");
        }
        if self.lease.is_some() != (self.status == JobStatus::Running) {
            return fail("lease must be held iff status is running");
        }
        if self.routed && self.status.is_terminal() {
            return fail("terminal jobs cannot hold a route reservation");
        }
        Ok(())
    }

    fn ensure_current_lease(&self, lease: LeaseToken, to: JobStatus) -> DomainResult<()> {
        if self.status != JobStatus::Running {
            return Err(DomainError::invalid_transition(self.status.as_str(), to.as_str()));
        }
        if self.lease != Some(lease) {
            return Err(DomainError::conflict(format!(
                "lease {lease} superseded on job {}",
                self.id
            )));
        }
        Ok(())
    }

    fn record_error(&mut self, detail: String, now: DateTime<Utc>) -> DomainResult<()> {
        if detail.trim().is_empty() {
            return Err(DomainError::validation("error detail must not be empty"));
        }
        self.status = JobStatus::Error;
        self.error_detail = Some(truncate(detail));
        self.result_ref = None;
        self.finished_at = Some(now);
        self.lease = None;
        self.routed = false;
        self.touch();
        Ok(())
    }

    fn reset_attempt(&mut self) {
        self.attempt += 1;
        self.result_ref = None;
        self.error_detail = None;
        self.started_at = None;
        self.finished_at = None;
        self.lease = None;
        self.routed = false;
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

impl AggregateRoot for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn truncate(mut detail: String) -> String {
    if detail.len() > MAX_ERROR_DETAIL_LEN {
        let mut cut = MAX_ERROR_DETAIL_LEN;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    detail
}
