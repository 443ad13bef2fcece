//! Queue consumer loop
//!
//! Each worker claims one job at a time, runs the handler, then acknowledges
//! or fails the job. Handlers never retry internally; redelivery and its
//! backoff belong to the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{Job, JobHandler, JobQueue, Redelivery, Topic};
use crate::error::PipelineResult;

/// Consumes one topic with a fixed number of concurrent workers
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    topic: Topic,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    worker_prefix: String,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn JobQueue>, topic: Topic, handler: Arc<dyn JobHandler>) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        Self {
            queue,
            topic,
            handler,
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            worker_prefix: format!("{}-{}-{}", topic, std::process::id(), &short[..6]),
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run workers until `shutdown` fires. In-progress jobs finish first.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.topic, workers = self.concurrency, "Waiting for jobs");

        let this = Arc::new(self);
        let mut handles = Vec::with_capacity(this.concurrency);

        for index in 0..this.concurrency {
            let worker = this.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("{}-{index}", worker.worker_prefix);
            handles.push(tokio::spawn(async move {
                worker.worker_loop(&worker_id, shutdown).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(queue = %this.topic, error = %e, "Queue worker panicked");
            }
        }

        info!(queue = %this.topic, "Queue workers stopped");
    }

    async fn worker_loop(&self, worker_id: &str, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.queue.claim(self.topic, worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(queue = %self.topic, worker = worker_id, error = %e, "Failed to claim job");
                    None
                },
            };

            match claimed {
                Some(job) => self.deliver(job).await,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {},
                    }
                },
            }
        }

        debug!(queue = %self.topic, worker = worker_id, "Worker exiting");
    }

    /// Claim and process jobs until none is deliverable. Returns the number
    /// of deliveries made, successful or not.
    pub async fn process_available(&self) -> PipelineResult<usize> {
        let worker_id = format!("{}-drain", self.worker_prefix);
        let mut delivered = 0;

        while let Some(job) = self.queue.claim(self.topic, &worker_id).await? {
            self.deliver(job).await;
            delivered += 1;
        }

        Ok(delivered)
    }

    async fn deliver(&self, job: Job) {
        let stage = self.handler.stage();
        let span = info_span!("job", stage, queue = %self.topic, job = job.id, attempt = job.attempts);

        async {
            match self.handler.handle(&job).await {
                Ok(()) => {
                    if let Err(e) = self.queue.complete(&job).await {
                        // The job will be redelivered after the visibility
                        // timeout; handlers tolerate that.
                        warn!(error = %e, "Failed to acknowledge job");
                    }
                },
                Err(e) => {
                    error!(payload = %job.payload, error = %e, "Stage failed");
                    match self.queue.fail(&job, &e.to_string()).await {
                        Ok(Redelivery::Scheduled {
                            attempts,
                            max_attempts,
                        }) => {
                            warn!(attempts, max_attempts, "Job scheduled for redelivery");
                        },
                        Ok(Redelivery::DeadLettered) => {
                            error!(payload = %job.payload, "Job dead-lettered after final attempt");
                        },
                        Err(fail_err) => {
                            warn!(error = %fail_err, "Failed to record job failure");
                        },
                    }
                },
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::queue::MemoryQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn stage(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _job: &Job) -> PipelineResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(PipelineError::Queue("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_process_available_retries_until_success() {
        let queue = Arc::new(MemoryQueue::new(5, Duration::ZERO));
        queue.enqueue(Topic::StagedData, "x").await.unwrap();

        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let worker = QueueWorker::new(queue.clone(), Topic::StagedData, handler.clone());

        assert_eq!(worker.process_available().await.unwrap(), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.pending(Topic::StagedData).is_empty());
        assert!(queue.dead(Topic::StagedData).is_empty());
    }

    #[tokio::test]
    async fn test_deterministic_failure_is_bounded() {
        let queue = Arc::new(MemoryQueue::new(3, Duration::ZERO));
        queue.enqueue(Topic::CleanedData, "x").await.unwrap();

        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let worker = QueueWorker::new(queue.clone(), Topic::CleanedData, handler.clone());

        assert_eq!(worker.process_available().await.unwrap(), 3);
        assert_eq!(queue.dead(Topic::CleanedData), ["x"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::default());
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        queue.enqueue(Topic::LoadedData, "a").await.unwrap();
        queue.enqueue(Topic::LoadedData, "b").await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = QueueWorker::new(queue.clone(), Topic::LoadedData, handler.clone())
            .concurrency(2)
            .poll_interval(Duration::from_millis(10));
        let running = tokio::spawn(worker.run(shutdown.clone()));

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(queue.pending(Topic::LoadedData).is_empty());
    }
}
