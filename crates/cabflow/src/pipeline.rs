//! Stage coordinator
//!
//! Wires each stage handler to its topic and runs them side by side. Stages
//! share nothing but the pool and the queue; ordering between batches is
//! whatever the queue delivers.

use futures::future::join_all;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::PipelineResult;
use crate::queue::{JobHandler, JobQueue, QueueWorker, Topic};
use crate::stages::{Cleaner, Finalizer, Loader, Stager};

pub struct Pipeline {
    queue: Arc<dyn JobQueue>,
    stages: Vec<(Topic, Arc<dyn JobHandler>)>,
    config: Config,
}

impl Pipeline {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>, config: Config) -> Self {
        let stages: Vec<(Topic, Arc<dyn JobHandler>)> = vec![
            (
                Topic::NewData,
                Arc::new(Stager::new(pool.clone(), queue.clone(), &config.pipeline)),
            ),
            (
                Topic::StagedData,
                Arc::new(Cleaner::new(pool.clone(), queue.clone())),
            ),
            (
                Topic::CleanedData,
                Arc::new(Loader::new(pool.clone(), queue.clone())),
            ),
            (Topic::LoadedData, Arc::new(Finalizer::new(pool))),
        ];

        Self {
            queue,
            stages,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueue a file for staging.
    pub async fn submit(&self, path: &Path) -> PipelineResult<()> {
        let payload = path.to_string_lossy();
        self.queue.enqueue(Topic::NewData, &payload).await?;
        info!(path = %payload, "Submitted file");
        Ok(())
    }

    fn workers(&self) -> impl Iterator<Item = QueueWorker> + '_ {
        self.stages.iter().map(|(topic, handler)| {
            QueueWorker::new(self.queue.clone(), *topic, handler.clone())
                .concurrency(self.config.pipeline.stage_concurrency)
                .poll_interval(self.config.queue.poll_interval())
        })
    }

    /// Consume all four topics until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            concurrency = self.config.pipeline.stage_concurrency,
            "Starting pipeline workers"
        );

        join_all(self.workers().map(|worker| worker.run(shutdown.clone()))).await;

        info!("Pipeline workers stopped");
    }

    /// Deliver jobs stage by stage until no topic has deliverable work.
    /// Returns the number of deliveries made. Jobs waiting out a retry
    /// backoff are left in place.
    pub async fn run_until_idle(&self) -> PipelineResult<usize> {
        let workers: Vec<QueueWorker> = self.workers().collect();
        let mut total = 0;

        loop {
            let mut round = 0;
            for worker in &workers {
                round += worker.process_available().await?;
            }
            if round == 0 {
                return Ok(total);
            }
            total += round;
        }
    }
}
