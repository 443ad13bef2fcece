//! Job queue backed by `pipeline.jobs`
//!
//! Workers claim jobs atomically with `FOR UPDATE SKIP LOCKED`, so any number
//! of processes can consume the same topic. A claimed job stays `running`
//! until it is acknowledged (deleted) or failed; if its worker disappears,
//! the job becomes claimable again once `locked_at` is older than the
//! visibility timeout.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use super::{DeadJob, Job, JobQueue, Redelivery, Topic};
use crate::config::QueueConfig;
use crate::error::PipelineResult;

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Jobs waiting or running on `topic` (dead jobs excluded).
    pub async fn depth(&self, topic: Topic) -> PipelineResult<i64> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pipeline.jobs WHERE queue = $1 AND status <> 'dead'",
        )
        .bind(topic.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(depth)
    }

    /// Dead-letter running jobs whose lease expired on their final attempt.
    async fn expire_exhausted(&self, topic: Topic) -> PipelineResult<()> {
        let expired = sqlx::query(
            r#"
            UPDATE pipeline.jobs
            SET status = 'dead',
                last_error = COALESCE(last_error, 'visibility timeout exceeded on final attempt'),
                locked_at = NULL,
                locked_by = NULL,
                updated_at = NOW()
            WHERE queue = $1
              AND status = 'running'
              AND attempts >= max_attempts
              AND locked_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(topic.as_str())
        .bind(self.config.visibility_timeout().as_secs_f64())
        .execute(&self.pool)
        .await?;

        if expired.rows_affected() > 0 {
            warn!(
                queue = %topic,
                count = expired.rows_affected(),
                "Dead-lettered jobs whose final attempt timed out"
            );
        }

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    payload: String,
    attempts: i32,
    max_attempts: i32,
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, topic: Topic, payload: &str) -> PipelineResult<()> {
        // new-data payloads are unique per path; a repeat is dropped here
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO pipeline.jobs (queue, payload, max_attempts)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(topic.as_str())
        .bind(payload)
        .bind(self.config.max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => debug!(queue = %topic, job = id, payload, "Enqueued job"),
            None => debug!(queue = %topic, payload, "Job for this payload already queued"),
        }
        Ok(())
    }

    async fn claim(&self, topic: Topic, worker_id: &str) -> PipelineResult<Option<Job>> {
        self.expire_exhausted(topic).await?;

        let row: Option<ClaimedRow> = sqlx::query_as(
            r#"
            UPDATE pipeline.jobs
            SET status = 'running',
                attempts = attempts + 1,
                locked_at = NOW(),
                locked_by = $2,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM pipeline.jobs
                WHERE queue = $1
                  AND attempts < max_attempts
                  AND (
                      (status = 'pending' AND run_at <= NOW())
                      OR (status = 'running' AND locked_at < NOW() - make_interval(secs => $3))
                  )
                ORDER BY run_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts, max_attempts
            "#,
        )
        .bind(topic.as_str())
        .bind(worker_id)
        .bind(self.config.visibility_timeout().as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Job {
            id: row.id,
            topic,
            payload: row.payload,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
        }))
    }

    async fn complete(&self, job: &Job) -> PipelineResult<()> {
        sqlx::query("DELETE FROM pipeline.jobs WHERE id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> PipelineResult<Redelivery> {
        let backoff = self.config.backoff_for(job.attempts);

        let (status, attempts, max_attempts): (String, i32, i32) = sqlx::query_as(
            r#"
            UPDATE pipeline.jobs
            SET status = CASE
                    WHEN attempts >= max_attempts THEN 'dead'
                    ELSE 'pending'
                END,
                last_error = $2,
                run_at = NOW() + make_interval(secs => $3),
                locked_at = NULL,
                locked_by = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING status, attempts, max_attempts
            "#,
        )
        .bind(job.id)
        .bind(error)
        .bind(backoff.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        Ok(if status == "dead" {
            Redelivery::DeadLettered
        } else {
            Redelivery::Scheduled {
                attempts,
                max_attempts,
            }
        })
    }

    async fn dead_jobs(&self, topic: Topic) -> PipelineResult<Vec<DeadJob>> {
        let rows: Vec<(i64, String, i32, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, payload, attempts, last_error
            FROM pipeline.jobs
            WHERE queue = $1 AND status = 'dead'
            ORDER BY updated_at DESC
            "#,
        )
        .bind(topic.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, payload, attempts, last_error)| DeadJob {
                id,
                topic,
                payload,
                attempts,
                last_error,
            })
            .collect())
    }

    async fn requeue_dead(&self, id: i64) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline.jobs
            SET status = 'pending', attempts = 0, run_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'dead'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
