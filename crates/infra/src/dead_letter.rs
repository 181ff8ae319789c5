//! Dead-letter health reporting.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use segq_jobs::Method;

use crate::jobs::RoutingTable;
use crate::queue::{QueueError, WorkQueue};

/// Depth of one dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterStatus {
    pub method: Method,
    pub queue: String,
    pub visible: usize,
    pub in_flight: usize,
}

/// Snapshot of every dead-letter queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterReport {
    pub queues: Vec<DeadLetterStatus>,
}

impl DeadLetterReport {
    /// Messages waiting for an operator across all queues.
    pub fn total(&self) -> usize {
        self.queues.iter().map(|q| q.visible + q.in_flight).sum()
    }

    pub fn for_method(&self, method: Method) -> Option<&DeadLetterStatus> {
        self.queues.iter().find(|q| q.method == method)
    }
}

pub async fn collect(routes: &RoutingTable) -> Result<DeadLetterReport, QueueError> {
    let mut queues = Vec::new();
    for (method, pair) in routes.iter() {
        let metrics = pair.dead_letter.metrics().await?;
        queues.push(DeadLetterStatus {
            method,
            queue: pair.dead_letter.name().to_string(),
            visible: metrics.visible,
            in_flight: metrics.in_flight,
        });
    }
    Ok(DeadLetterReport { queues })
}

/// Collect and log a report; non-empty dead-letter queues are a warning.
pub async fn report(routes: &RoutingTable) -> Result<DeadLetterReport, QueueError> {
    let report = collect(routes).await?;
    for status in &report.queues {
        let waiting = status.visible + status.in_flight;
        if waiting > 0 {
            warn!(
                queue = %status.queue,
                method = %status.method,
                visible = status.visible,
                in_flight = status.in_flight,
                "dead-letter queue needs attention"
            );
        }
    }
    if report.total() == 0 {
        info!("dead-letter queues empty");
    }
    Ok(report)
}

/// Report every `interval` until `shutdown` is notified.
pub fn spawn_reporter(routes: RoutingTable, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    if let Err(e) = report(&routes).await {
                        warn!(error = %e, "dead-letter report failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::QueuePair;
    use crate::queue::{InMemoryWorkQueue, QueueConfig, WorkQueue};
    use segq_jobs::RoutingMessage;

    fn pair(name: &str) -> (QueuePair, Arc<InMemoryWorkQueue<RoutingMessage>>) {
        let dlq = Arc::new(InMemoryWorkQueue::new(format!("{name}-dlq"), QueueConfig::default()));
        let work = Arc::new(InMemoryWorkQueue::with_dead_letter(name, QueueConfig::default(), dlq.clone()));
        (
            QueuePair {
                work,
                dead_letter: dlq.clone(),
            },
            dlq,
        )
    }

    #[tokio::test]
    async fn empty_queues_report_zero() {
        let (grabcut, _) = pair("grabcut");
        let (sam, _) = pair("sam");
        let report = collect(&RoutingTable::new(grabcut, sam)).await.unwrap();

        assert_eq!(report.queues.len(), 2);
        assert_eq!(report.total(), 0);
        assert_eq!(report.for_method(Method::Sam).unwrap().queue, "sam-dlq");
    }

    #[tokio::test]
    async fn counts_dead_lettered_messages_per_method() {
        use chrono::Utc;
        use segq_core::{ArtifactRef, JobId, OwnerId};
        use segq_jobs::{Job, NewJob};

        let (grabcut, grabcut_dlq) = pair("grabcut");
        let (sam, _) = pair("sam");
        let job = Job::new(
            JobId::new(5),
            NewJob {
                owner_id: OwnerId::new("gus").unwrap(),
                input_ref: ArtifactRef::new("uploads/gus/a.png").unwrap(),
                method: "grabcut".to_string(),
                params: serde_json::json!({}),
            },
            Utc::now(),
        );
        grabcut_dlq.send(RoutingMessage::for_job(&job).unwrap()).await.unwrap();

        let report = report(&RoutingTable::new(grabcut, sam)).await.unwrap();
        assert_eq!(report.for_method(Method::GrabCut).unwrap().visible, 1);
        assert_eq!(report.for_method(Method::Sam).unwrap().visible, 0);
        assert_eq!(report.total(), 1);
    }
}
