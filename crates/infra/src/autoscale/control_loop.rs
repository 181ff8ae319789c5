//! Periodic sampling of queue backlog and pool size into scaling decisions.
//!
//! The loop only reads metrics and emits [`ScalingEvaluation`]s to a
//! [`DecisionSink`]. Acting on a decision is the sink's business.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::policy::{QueueMetricSnapshot, ScalingController, ScalingDecision, ScalingEvaluation, ScalingPolicy};
use crate::queue::{QueueError, WorkQueue};

/// Produces one snapshot per tick for one queue.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn sample(&self) -> Result<QueueMetricSnapshot, QueueError>;
}

/// Current size of a worker pool (`m3`).
pub trait RunningWorkers: Send + Sync {
    fn running_workers(&self) -> usize;
}

/// Consumer of scaling decisions (a capacity manager, a recorder, a log).
pub trait DecisionSink: Send + Sync {
    fn apply(&self, evaluation: &ScalingEvaluation);
}

/// Samples a work queue's depth and a pool's size.
pub struct QueueSampler<M> {
    queue: Arc<dyn WorkQueue<M>>,
    workers: Arc<dyn RunningWorkers>,
}

impl<M> QueueSampler<M> {
    pub fn new(queue: Arc<dyn WorkQueue<M>>, workers: Arc<dyn RunningWorkers>) -> Self {
        Self { queue, workers }
    }
}

#[async_trait]
impl<M: Send + 'static> MetricsSource for QueueSampler<M> {
    fn queue_name(&self) -> &str {
        self.queue.name()
    }

    async fn sample(&self) -> Result<QueueMetricSnapshot, QueueError> {
        let metrics = self.queue.metrics().await?;
        Ok(QueueMetricSnapshot {
            queue: self.queue.name().to_string(),
            visible: metrics.visible,
            in_flight: metrics.in_flight,
            running_workers: self.workers.running_workers(),
            sampled_at: Utc::now(),
        })
    }
}

struct Tracked {
    source: Arc<dyn MetricsSource>,
    sink: Arc<dyn DecisionSink>,
    controller: ScalingController,
}

/// One controller per tracked queue, evaluated on a fixed cadence.
pub struct ControlLoop {
    interval: Duration,
    tracked: Vec<Tracked>,
}

impl ControlLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            tracked: Vec::new(),
        }
    }

    /// Evaluate `source` with its own history and send decisions to `sink`.
    pub fn track(
        mut self,
        source: Arc<dyn MetricsSource>,
        policy: ScalingPolicy,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        self.tracked.push(Tracked {
            source,
            sink,
            controller: ScalingController::new(policy),
        });
        self
    }

    /// Sample every queue once. A queue whose sample fails is skipped for
    /// this tick and its history is left as it was.
    pub async fn tick(&mut self) -> Vec<ScalingEvaluation> {
        let mut evaluations = Vec::with_capacity(self.tracked.len());

        for tracked in &mut self.tracked {
            let snapshot = match tracked.source.sample().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(queue = tracked.source.queue_name(), error = %e, "metrics sample failed");
                    continue;
                }
            };

            let evaluation = tracked.controller.evaluate(&snapshot);
            debug!(
                queue = %evaluation.queue,
                visible = snapshot.visible,
                in_flight = snapshot.in_flight,
                running_workers = snapshot.running_workers,
                wait_seconds = evaluation.wait_seconds,
                decision = %evaluation.decision,
                "scaling evaluated"
            );
            if evaluation.decision != ScalingDecision::Hold {
                info!(
                    queue = %evaluation.queue,
                    wait_seconds = evaluation.wait_seconds,
                    decision = %evaluation.decision,
                    "scaling decision"
                );
            }

            tracked.sink.apply(&evaluation);
            evaluations.push(evaluation);
        }

        evaluations
    }

    /// Tick every `interval` until `shutdown` is notified.
    pub fn spawn(mut self, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(queues = self.tracked.len(), interval_secs = self.interval.as_secs(), "control loop started");

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }

            info!("control loop stopped");
        })
    }
}
