//! In-process queue sharing the job table's retry, dead-letter and
//! new-data dedupe rules
//!
//! Nothing survives a restart, so this is for tests and embedding only.
//! Claimed jobs are held in flight until acknowledged or failed. There is no
//! visibility timeout: a job whose worker dies mid-delivery is never
//! redelivered.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{DeadJob, Job, JobQueue, Redelivery, Topic};
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    run_at: Instant,
    last_error: Option<String>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    ready: HashMap<Topic, VecDeque<Entry>>,
    in_flight: HashMap<i64, Entry>,
    dead: Vec<Entry>,
}

impl State {
    /// Any queued, in-flight or dead job on `topic` carries `payload`.
    fn holds(&self, topic: Topic, payload: &str) -> bool {
        let matches = |e: &Entry| e.job.topic == topic && e.job.payload == payload;
        self.ready.get(&topic).is_some_and(|q| q.iter().any(matches))
            || self.in_flight.values().any(matches)
            || self.dead.iter().any(matches)
    }
}

pub struct MemoryQueue {
    state: Mutex<State>,
    max_attempts: i32,
    backoff: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_JOB_MAX_ATTEMPTS, Duration::ZERO)
    }
}

impl MemoryQueue {
    pub fn new(max_attempts: i32, backoff: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_attempts,
            backoff,
        }
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::Queue("memory queue lock poisoned".into()))
    }

    /// Payloads waiting on `topic`, in delivery order.
    pub fn pending(&self, topic: Topic) -> Vec<String> {
        self.lock()
            .map(|state| {
                state
                    .ready
                    .get(&topic)
                    .map(|q| q.iter().map(|e| e.job.payload.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Payloads dead-lettered on `topic`.
    pub fn dead(&self, topic: Topic) -> Vec<String> {
        self.lock()
            .map(|state| {
                state
                    .dead
                    .iter()
                    .filter(|e| e.job.topic == topic)
                    .map(|e| e.job.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().map(|state| state.in_flight.len()).unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, topic: Topic, payload: &str) -> PipelineResult<()> {
        let mut state = self.lock()?;
        if topic == Topic::NewData && state.holds(topic, payload) {
            return Ok(());
        }
        state.next_id += 1;
        let job = Job {
            id: state.next_id,
            topic,
            payload: payload.to_string(),
            attempts: 0,
            max_attempts: self.max_attempts,
        };
        state.ready.entry(topic).or_default().push_back(Entry {
            job,
            run_at: Instant::now(),
            last_error: None,
        });
        Ok(())
    }

    async fn claim(&self, topic: Topic, _worker_id: &str) -> PipelineResult<Option<Job>> {
        let mut state = self.lock()?;
        let now = Instant::now();

        let Some(queue) = state.ready.get_mut(&topic) else {
            return Ok(None);
        };
        let Some(pos) = queue.iter().position(|e| e.run_at <= now) else {
            return Ok(None);
        };
        let Some(mut entry) = queue.remove(pos) else {
            return Ok(None);
        };

        entry.job.attempts += 1;
        let job = entry.job.clone();
        state.in_flight.insert(job.id, entry);
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> PipelineResult<()> {
        self.lock()?.in_flight.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> PipelineResult<Redelivery> {
        let mut state = self.lock()?;
        let mut entry = state
            .in_flight
            .remove(&job.id)
            .ok_or_else(|| PipelineError::Queue(format!("job {} is not in flight", job.id)))?;

        entry.last_error = Some(error.to_string());

        if entry.job.attempts >= entry.job.max_attempts {
            state.dead.push(entry);
            return Ok(Redelivery::DeadLettered);
        }

        let attempts = entry.job.attempts;
        let max_attempts = entry.job.max_attempts;
        entry.run_at = Instant::now() + self.backoff * attempts.max(1) as u32;
        state.ready.entry(job.topic).or_default().push_back(entry);

        Ok(Redelivery::Scheduled {
            attempts,
            max_attempts,
        })
    }

    async fn dead_jobs(&self, topic: Topic) -> PipelineResult<Vec<DeadJob>> {
        let state = self.lock()?;
        Ok(state
            .dead
            .iter()
            .filter(|e| e.job.topic == topic)
            .map(|e| DeadJob {
                id: e.job.id,
                topic,
                payload: e.job.payload.clone(),
                attempts: e.job.attempts,
                last_error: e.last_error.clone(),
            })
            .collect())
    }

    async fn requeue_dead(&self, id: i64) -> PipelineResult<bool> {
        let mut state = self.lock()?;
        let Some(pos) = state.dead.iter().position(|e| e.job.id == id) else {
            return Ok(false);
        };

        let mut entry = state.dead.remove(pos);
        entry.job.attempts = 0;
        entry.run_at = Instant::now();
        state.ready.entry(entry.job.topic).or_default().push_back(entry);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_claim_and_complete() {
        let queue = MemoryQueue::default();
        queue.enqueue(Topic::StagedData, "pipeline.trips_staging_00000001").await.unwrap();
        queue.enqueue(Topic::StagedData, "pipeline.trips_staging_00000002").await.unwrap();

        let first = queue.claim(Topic::StagedData, "w").await.unwrap().unwrap();
        assert_eq!(first.payload, "pipeline.trips_staging_00000001");
        assert_eq!(first.attempts, 1);
        assert_eq!(queue.in_flight(), 1);

        queue.complete(&first).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.pending(Topic::StagedData), ["pipeline.trips_staging_00000002"]);
        assert!(queue.claim(Topic::CleanedData, "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_redelivers_then_dead_letters() {
        let queue = MemoryQueue::new(2, Duration::ZERO);
        queue.enqueue(Topic::LoadedData, "t").await.unwrap();

        let job = queue.claim(Topic::LoadedData, "w").await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&job, "boom").await.unwrap(),
            Redelivery::Scheduled { attempts: 1, max_attempts: 2 }
        );

        let job = queue.claim(Topic::LoadedData, "w").await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(queue.fail(&job, "boom again").await.unwrap(), Redelivery::DeadLettered);

        assert!(queue.claim(Topic::LoadedData, "w").await.unwrap().is_none());
        let dead = queue.dead_jobs(Topic::LoadedData).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom again"));

        assert!(queue.requeue_dead(dead[0].id).await.unwrap());
        let job = queue.claim(Topic::LoadedData, "w").await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_new_data_payloads_are_not_duplicated() {
        let queue = MemoryQueue::new(1, Duration::ZERO);
        queue.enqueue(Topic::NewData, "/in/a.csv").await.unwrap();
        queue.enqueue(Topic::NewData, "/in/a.csv").await.unwrap();
        assert_eq!(queue.pending(Topic::NewData), ["/in/a.csv"]);

        let job = queue.claim(Topic::NewData, "w").await.unwrap().unwrap();
        queue.enqueue(Topic::NewData, "/in/a.csv").await.unwrap();
        assert!(queue.pending(Topic::NewData).is_empty());

        queue.complete(&job).await.unwrap();
        queue.enqueue(Topic::NewData, "/in/a.csv").await.unwrap();
        assert_eq!(queue.pending(Topic::NewData), ["/in/a.csv"]);

        queue.enqueue(Topic::StagedData, "t").await.unwrap();
        queue.enqueue(Topic::StagedData, "t").await.unwrap();
        assert_eq!(queue.pending(Topic::StagedData).len(), 2);
    }

    #[tokio::test]
    async fn test_backoff_delays_redelivery() {
        let queue = MemoryQueue::new(3, Duration::from_secs(60));
        queue.enqueue(Topic::NewData, "/in/a.csv").await.unwrap();

        let job = queue.claim(Topic::NewData, "w").await.unwrap().unwrap();
        queue.fail(&job, "later").await.unwrap();

        assert!(queue.claim(Topic::NewData, "w").await.unwrap().is_none());
        assert_eq!(queue.pending(Topic::NewData), ["/in/a.csv"]);
    }
}
