//! Durable job queue
//!
//! Stages talk to each other only through four named topics. Each job
//! carries a single string: a file path for `new-data`, a staging table name
//! for the rest. Delivery is at-least-once: a handler signals success by
//! returning `Ok`, and anything else (an `Err`, a crash, a worker that
//! outlives the visibility timeout) makes the job eligible again until its
//! attempt budget runs out and it is dead-lettered.
//!
//! - **postgres**: `PgJobQueue`, the job table used in production
//! - **memory**: `MemoryQueue`, same semantics in process, for tests
//! - **worker**: `QueueWorker`, the claim/handle/ack loop shared by both

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};

pub mod memory;
pub mod postgres;
pub mod worker;

pub use memory::MemoryQueue;
pub use postgres::PgJobQueue;
pub use worker::QueueWorker;

/// Stage transition topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// A source file is ready to stage. Payload: file path.
    NewData,
    /// A staging table is loaded with raw rows. Payload: table name.
    StagedData,
    /// Invalid rows have been quarantined. Payload: table name.
    CleanedData,
    /// Rows are in the canonical table. Payload: table name.
    LoadedData,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::NewData,
        Topic::StagedData,
        Topic::CleanedData,
        Topic::LoadedData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NewData => "new-data",
            Topic::StagedData => "staged-data",
            Topic::CleanedData => "cleaned-data",
            Topic::LoadedData => "loaded-data",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownTopic(s.to_string()))
    }
}

/// A delivered job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub topic: Topic,
    pub payload: String,
    /// Deliveries so far, this one included
    pub attempts: i32,
    pub max_attempts: i32,
}

/// A job that exhausted its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadJob {
    pub id: i64,
    pub topic: Topic,
    pub payload: String,
    pub attempts: i32,
    pub last_error: Option<String>,
}

/// What happened to a job after a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Will be delivered again after a backoff
    Scheduled { attempts: i32, max_attempts: i32 },
    /// Attempts exhausted; parked until requeued by hand
    DeadLettered,
}

/// Work performed for each delivered job
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Short stage name used in logs
    fn stage(&self) -> &'static str;

    async fn handle(&self, job: &Job) -> PipelineResult<()>;
}

/// Queue provider capability
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. A `new-data` payload already queued, running or dead is
    /// not added again.
    async fn enqueue(&self, topic: Topic, payload: &str) -> PipelineResult<()>;

    /// Take the next deliverable job on `topic`, hiding it from other workers.
    async fn claim(&self, topic: Topic, worker_id: &str) -> PipelineResult<Option<Job>>;

    /// Acknowledge a job; it will not be delivered again.
    async fn complete(&self, job: &Job) -> PipelineResult<()>;

    /// Record a failed delivery and schedule the next one, or dead-letter it.
    async fn fail(&self, job: &Job, error: &str) -> PipelineResult<Redelivery>;

    async fn dead_jobs(&self, topic: Topic) -> PipelineResult<Vec<DeadJob>>;

    /// Give a dead job a fresh attempt budget. Returns false if no such job.
    async fn requeue_dead(&self, id: i64) -> PipelineResult<bool>;
}
