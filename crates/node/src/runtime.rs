//! Process wiring from a [`Config`].

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use segq_events::InMemoryEventBus;
use segq_infra::Config;
use segq_infra::autoscale::{ControlLoop, QueueSampler};
use segq_infra::config::dead_letter_name;
use segq_infra::dead_letter;
use segq_infra::jobs::{InMemoryJobStore, JobRouter, JobService, QueuePair, RoutingTable};
use segq_infra::queue::InMemoryWorkQueue;
use segq_infra::workers::{Segmenter, WorkerConfig, WorkerPool};
use segq_jobs::{Method, RoutingMessage};

pub type NodeService = JobService<Arc<InMemoryJobStore>, Arc<InMemoryEventBus<RoutingMessage>>>;

/// A background task and the signal that stops it.
struct Background {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// A running node.
pub struct Node {
    service: Arc<NodeService>,
    pools: Vec<(Method, Arc<WorkerPool>)>,
    background: Vec<Background>,
}

impl Node {
    /// Build every component and start the pools, the control loop and, when
    /// configured, the dead-letter reporter. Must be called from within a
    /// tokio runtime.
    pub fn start(config: &Config, segmenter: Arc<dyn Segmenter>) -> anyhow::Result<Self> {
        let routes = RoutingTable::new(
            queue_pair(&config.grabcut_queue, config),
            queue_pair(&config.sam_queue, config),
        );
        let bus = Arc::new(InMemoryEventBus::new());
        routes.install(&bus).context("failed to install routing rules")?;

        let store = InMemoryJobStore::arc();
        let service = Arc::new(JobService::new(store.clone(), JobRouter::new(bus), routes.clone()));

        let worker_config = WorkerConfig::default()
            .with_receive_wait(config.receive_wait)
            .with_visibility_timeout(config.queue.visibility_timeout)
            .with_heartbeat(config.heartbeat);

        let mut pools = Vec::new();
        let mut control = ControlLoop::new(config.sample_interval);
        for (method, pair) in routes.iter() {
            let pool = Arc::new(WorkerPool::new(
                worker_config.clone(),
                pair.work.clone(),
                store.clone(),
                segmenter.clone(),
                config.pool,
            ));
            pool.scale_to(config.initial_workers);
            control = control.track(
                Arc::new(QueueSampler::new(pair.work.clone(), pool.clone())),
                config.scaling,
                pool.clone(),
            );
            pools.push((method, pool));
        }

        let mut background = Vec::new();
        let shutdown = Arc::new(Notify::new());
        background.push(Background {
            name: "control loop",
            handle: control.spawn(shutdown.clone()),
            shutdown,
        });

        if let Some(interval) = config.dead_letter_report_interval {
            let shutdown = Arc::new(Notify::new());
            background.push(Background {
                name: "dead-letter reporter",
                handle: dead_letter::spawn_reporter(routes, interval, shutdown.clone()),
                shutdown,
            });
        }

        info!(
            grabcut_queue = %config.grabcut_queue,
            sam_queue = %config.sam_queue,
            initial_workers = config.initial_workers,
            "node started"
        );

        Ok(Self {
            service,
            pools,
            background,
        })
    }

    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    pub fn pool(&self, method: Method) -> Option<&Arc<WorkerPool>> {
        self.pools.iter().find(|(m, _)| *m == method).map(|(_, pool)| pool)
    }

    /// Stop background tasks, then drain the pools. Running jobs finish.
    pub async fn shutdown(self) {
        for task in self.background {
            task.shutdown.notify_one();
            if let Err(e) = task.handle.await {
                warn!(task = task.name, error = %e, "background task ended abnormally");
            }
        }
        for (_, pool) in &self.pools {
            pool.shutdown().await;
        }

        match self.service.stats() {
            Ok(stats) => info!(
                queued = stats.queued,
                running = stats.running,
                done = stats.done,
                error = stats.error,
                "node stopped"
            ),
            Err(e) => warn!(error = %e, "node stopped; job stats unavailable"),
        }
    }
}

fn queue_pair(name: &str, config: &Config) -> QueuePair {
    let dead_letter = Arc::new(InMemoryWorkQueue::new(dead_letter_name(name), config.queue));
    let work = Arc::new(InMemoryWorkQueue::with_dead_letter(
        name,
        config.queue,
        dead_letter.clone(),
    ));
    QueuePair { work, dead_letter }
}
