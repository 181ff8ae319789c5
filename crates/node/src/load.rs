//! Synthetic load: submit and start a batch of jobs the way a bursty client
//! script does, including repeated start calls for the same job.

use anyhow::Context;
use serde_json::json;
use tracing::info;

use segq_core::{ArtifactRef, JobId, OwnerId};
use segq_infra::jobs::StartOutcome;
use segq_jobs::{Method, NewJob};

use crate::runtime::NodeService;

/// Shape of one synthetic batch.
#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub jobs: usize,
    pub repeat: u32,
    /// Start calls per job; everything after the first must be absorbed.
    pub starts_per_job: usize,
    pub owner: String,
    pub input: String,
}

impl LoadProfile {
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs,
            repeat: 16,
            starts_per_job: 3,
            owner: "load-test".to_string(),
            input: "uploads/load-test/sample-leaf.jpg".to_string(),
        }
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_starts_per_job(mut self, starts: usize) -> Self {
        self.starts_per_job = starts.max(1);
        self
    }

    /// Methods alternate so both queues see traffic.
    pub fn method_for(&self, index: usize) -> Method {
        Method::ALL[index % Method::ALL.len()]
    }
}

/// Create and start every job in `profile`. Returns the job ids in
/// submission order.
pub async fn submit(service: &NodeService, profile: &LoadProfile) -> anyhow::Result<Vec<JobId>> {
    let owner_id = OwnerId::new(profile.owner.clone()).context("invalid load-test owner")?;
    let input_ref = ArtifactRef::new(profile.input.clone()).context("invalid load-test input")?;

    let mut ids = Vec::with_capacity(profile.jobs);
    let mut absorbed = 0usize;
    for index in 0..profile.jobs {
        let method = profile.method_for(index);
        let job_id = service
            .create_job(NewJob {
                owner_id: owner_id.clone(),
                input_ref: input_ref.clone(),
                method: method.as_str().to_string(),
                params: json!({ "repeat": profile.repeat }),
            })
            .context("failed to create load-test job")?;

        for _ in 0..profile.starts_per_job.max(1) {
            let outcome = service
                .start_job(job_id)
                .await
                .with_context(|| format!("failed to start load-test job {job_id}"))?;
            if matches!(outcome, StartOutcome::AlreadyRouted | StartOutcome::AlreadyStarted(_)) {
                absorbed += 1;
            }
        }
        ids.push(job_id);
    }

    info!(jobs = ids.len(), repeat = profile.repeat, absorbed_starts = absorbed, "load-test batch submitted");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use segq_infra::Config;
    use segq_infra::queue::WorkQueue;
    use segq_jobs::JobStatus;

    use crate::{Node, SyntheticSegmenter};

    #[test]
    fn methods_alternate() {
        let profile = LoadProfile::new(4);
        let methods: Vec<_> = (0..4).map(|i| profile.method_for(i)).collect();
        assert_eq!(methods, [Method::GrabCut, Method::Sam, Method::GrabCut, Method::Sam]);
    }

    #[tokio::test]
    async fn repeated_starts_enqueue_one_message_per_job() {
        let config = Config {
            initial_workers: 0,
            ..Config::default()
        };
        let node = Node::start(&config, Arc::new(SyntheticSegmenter::new(1))).unwrap();

        let profile = LoadProfile::new(5).with_starts_per_job(4);
        let ids = submit(node.service(), &profile).await.unwrap();

        let routes = node.service().routes();
        let grabcut = routes.for_method(Method::GrabCut).work.metrics().await.unwrap();
        let sam = routes.for_method(Method::Sam).work.metrics().await.unwrap();
        assert_eq!(grabcut.visible, 3);
        assert_eq!(sam.visible, 2);
        for id in ids {
            let job = node.service().get_job(id).unwrap();
            assert_eq!(job.status(), JobStatus::Queued);
            assert!(job.is_routed());
        }

        tokio::time::timeout(Duration::from_secs(5), node.shutdown()).await.unwrap();
    }
}
