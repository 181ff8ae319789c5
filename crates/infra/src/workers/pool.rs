//! In-process capacity manager: a bounded pool of worker tasks per queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use segq_jobs::RoutingMessage;

use super::segmenter::Segmenter;
use super::worker::{Worker, WorkerConfig, WorkerStats};
use crate::autoscale::{DecisionSink, RunningWorkers, ScalingDecision, ScalingEvaluation};
use crate::jobs::JobStore;
use crate::queue::WorkQueue;

/// Pool size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    pub min: usize,
    pub max: usize,
}

impl PoolBounds {
    pub fn clamp(&self, n: usize) -> usize {
        n.clamp(self.min, self.max)
    }
}

impl Default for PoolBounds {
    fn default() -> Self {
        Self { min: 0, max: 8 }
    }
}

struct Slot {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    active: Vec<Slot>,
    /// Told to stop; may still be finishing a job.
    draining: Vec<JoinHandle<()>>,
}

/// Grows and shrinks a set of [`Worker`] tasks on one queue.
///
/// Consumes scaling decisions one step at a time and reports its size as the
/// running-worker count the control loop samples.
pub struct WorkerPool {
    name: String,
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue<RoutingMessage>>,
    store: Arc<dyn JobStore>,
    segmenter: Arc<dyn Segmenter>,
    bounds: PoolBounds,
    slots: Mutex<Slots>,
    stats: Arc<Mutex<WorkerStats>>,
    spawned: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue<RoutingMessage>>,
        store: Arc<dyn JobStore>,
        segmenter: Arc<dyn Segmenter>,
        bounds: PoolBounds,
    ) -> Self {
        Self {
            name: queue.name().to_string(),
            config,
            queue,
            store,
            segmenter,
            bounds,
            slots: Mutex::new(Slots::default()),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    /// Combined statistics of every worker this pool has run.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resize to `target`, clamped to the bounds. Must be called from within a
    /// tokio runtime. Returns the new size.
    pub fn scale_to(&self, target: usize) -> usize {
        let target = self.bounds.clamp(target);
        let mut slots = self.slots();
        slots.active.retain(|s| !s.handle.is_finished());
        slots.draining.retain(|h| !h.is_finished());

        let before = slots.active.len();
        while slots.active.len() < target {
            slots.active.push(self.spawn_worker());
        }
        while slots.active.len() > target {
            if let Some(slot) = slots.active.pop() {
                slot.shutdown.notify_one();
                slots.draining.push(slot.handle);
            }
        }

        let after = slots.active.len();
        if after != before {
            info!(pool = %self.name, from = before, to = after, "worker pool resized");
        }
        after
    }

    /// Stop every worker and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots();
            let mut handles: Vec<_> = slots.draining.drain(..).collect();
            for slot in slots.active.drain(..) {
                slot.shutdown.notify_one();
                handles.push(slot.handle);
            }
            handles
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(pool = %self.name, error = %e, "worker task ended abnormally");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }

    fn spawn_worker(&self) -> Slot {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::new(
            self.config.clone().with_name(format!("{}-{index}", self.name)),
            self.queue.clone(),
            self.store.clone(),
            self.segmenter.clone(),
        )
        .with_stats(self.stats.clone());

        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(signal).await });
        Slot { shutdown, handle }
    }
}

impl RunningWorkers for WorkerPool {
    fn running_workers(&self) -> usize {
        let mut slots = self.slots();
        slots.active.retain(|s| !s.handle.is_finished());
        slots.active.len()
    }
}

impl DecisionSink for WorkerPool {
    /// One worker more or fewer per decision, within bounds.
    fn apply(&self, evaluation: &ScalingEvaluation) {
        let current = self.running_workers();
        match evaluation.decision {
            ScalingDecision::ScaleOut => {
                self.scale_to(current + 1);
            }
            ScalingDecision::ScaleIn => {
                self.scale_to(current.saturating_sub(1));
            }
            ScalingDecision::Hold => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use segq_core::{AggregateRoot, ArtifactRef, ExpectedVersion, OwnerId};
    use segq_jobs::{ExecutionError, JobStatus, NewJob};

    use crate::jobs::InMemoryJobStore;
    use crate::queue::{InMemoryWorkQueue, QueueConfig};

    struct Immediate;

    #[async_trait]
    impl Segmenter for Immediate {
        async fn segment(&self, order: &RoutingMessage) -> Result<ArtifactRef, ExecutionError> {
            ArtifactRef::new(order.result_key()).map_err(|e| ExecutionError::Algorithm(e.to_string()))
        }
    }

    fn pool(store: Arc<InMemoryJobStore>, queue: Arc<InMemoryWorkQueue<RoutingMessage>>) -> WorkerPool {
        WorkerPool::new(
            WorkerConfig::default(),
            queue,
            store,
            Arc::new(Immediate),
            PoolBounds { min: 0, max: 2 },
        )
    }

    fn evaluation(decision: ScalingDecision) -> ScalingEvaluation {
        ScalingEvaluation {
            queue: "grabcut".to_string(),
            wait_seconds: 0.0,
            decision,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decisions_step_size_within_bounds() {
        let queue = Arc::new(InMemoryWorkQueue::new("grabcut", QueueConfig::default()));
        let pool = pool(InMemoryJobStore::arc(), queue);
        assert_eq!(pool.running_workers(), 0);

        for expected in [1, 2, 2] {
            pool.apply(&evaluation(ScalingDecision::ScaleOut));
            assert_eq!(pool.running_workers(), expected);
        }
        pool.apply(&evaluation(ScalingDecision::Hold));
        assert_eq!(pool.running_workers(), 2);

        for expected in [1, 0, 0] {
            pool.apply(&evaluation(ScalingDecision::ScaleIn));
            assert_eq!(pool.running_workers(), expected);
        }
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_workers_drain_the_queue() {
        let store = InMemoryJobStore::arc();
        let queue = Arc::new(InMemoryWorkQueue::new("grabcut", QueueConfig::default()));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let mut job = store
                .create(NewJob {
                    owner_id: OwnerId::new("fay").unwrap(),
                    input_ref: ArtifactRef::new("uploads/fay/in.png").unwrap(),
                    method: "grabcut".to_string(),
                    params: json!({}),
                })
                .unwrap();
            let base = job.version();
            let message = RoutingMessage::for_job(&job).unwrap();
            job.mark_routed().unwrap();
            store.save(&job, ExpectedVersion::Exact(base)).unwrap();
            queue.send(message).await.unwrap();
            ids.push(job.id_typed());
        }

        let pool = pool(store.clone(), queue.clone());
        assert_eq!(pool.scale_to(2), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.shutdown().await;

        for id in ids {
            let job = store.get(id).unwrap().unwrap();
            assert_eq!(job.status(), JobStatus::Done);
            assert!(job.finished_at().unwrap() >= job.created_at());
        }
        assert_eq!(pool.stats().completed, 4);
        assert_eq!(queue.metrics().await.unwrap().backlog(), 0);
    }
}
