//! Batch state records
//!
//! `pipeline.batches` holds one row per batch so progress is queryable
//! without looking at file names or queue contents. Every write is an upsert
//! or a keyed forward-only update, so replaying a stage after redelivery
//! never rewinds a batch.

use sqlx::{PgExecutor, PgPool};
use std::path::PathBuf;
use tracing::debug;

use crate::batch::{Batch, BatchId, BatchState};
use crate::error::PipelineResult;
use crate::schema::TableName;

/// Row shape of `pipeline.batches`
#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    batch_id: String,
    source_path: String,
    staging_table: String,
    state: String,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = crate::error::PipelineError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(Batch {
            id: BatchId::parse(&row.batch_id)?,
            source_path: PathBuf::from(row.source_path),
            staging_table: row.staging_table.parse()?,
            state: row.state.parse()?,
            last_error: row.last_error,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        })
    }
}

#[derive(Clone)]
pub struct BatchTracker {
    pool: PgPool,
}

impl BatchTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a batch entering `state` (Staged or Failed from the stager).
    pub async fn record(&self, batch: &Batch) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline.batches (batch_id, source_path, staging_table, state, last_error)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (batch_id) DO UPDATE
            SET state = EXCLUDED.state,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            "#,
        )
        .bind(batch.id.as_str())
        .bind(batch.source_path.to_string_lossy().as_ref())
        .bind(batch.staging_table.to_string())
        .bind(batch.state.as_str())
        .bind(batch.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move the batch owning `table` to `state` if it is in one of the
    /// state's predecessors. Returns whether the record changed.
    ///
    /// Takes any executor so stages can fold the update into their own
    /// transaction. A table without a record (e.g. created by hand) is left
    /// alone, as is a batch that already moved further.
    pub async fn transition<'e, E>(
        executor: E,
        table: &TableName,
        state: BatchState,
    ) -> PipelineResult<bool>
    where
        E: PgExecutor<'e>,
    {
        let from: Vec<&str> = state.predecessors().iter().map(|s| s.as_str()).collect();

        let updated = sqlx::query(
            r#"
            UPDATE pipeline.batches
            SET state = $1, last_error = NULL, updated_at = NOW()
            WHERE staging_table = $2 AND state = ANY($3)
            "#,
        )
        .bind(state.as_str())
        .bind(table.to_string())
        .bind(from)
        .execute(executor)
        .await?
        .rows_affected();

        if updated == 0 {
            debug!(table = %table, state = %state, "Batch record not moved");
        }
        Ok(updated > 0)
    }

    /// Current state of the batch owning `table`, locking its record until
    /// the surrounding transaction ends. Concurrent deliveries for the same
    /// batch queue up behind the lock.
    pub async fn lock_state<'e, E>(
        executor: E,
        table: &TableName,
    ) -> PipelineResult<Option<BatchState>>
    where
        E: PgExecutor<'e>,
    {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            SELECT state FROM pipeline.batches
            WHERE staging_table = $1
            FOR UPDATE
            "#,
        )
        .bind(table.to_string())
        .fetch_optional(executor)
        .await?;

        state.map(|s| s.parse()).transpose()
    }

    /// Convenience wrapper running [`BatchTracker::transition`] on the pool.
    pub async fn set_state(&self, table: &TableName, state: BatchState) -> PipelineResult<bool> {
        Self::transition(&self.pool, table, state).await
    }

    pub async fn get(&self, id: &BatchId) -> PipelineResult<Option<Batch>> {
        let row: Option<BatchRow> = sqlx::query_as(
            r#"
            SELECT batch_id, source_path, staging_table, state, last_error, created_at, updated_at
            FROM pipeline.batches
            WHERE batch_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Batch::try_from).transpose()
    }

    /// Batches ordered by most recent activity.
    pub async fn list_recent(&self, limit: i64) -> PipelineResult<Vec<Batch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(
            r#"
            SELECT batch_id, source_path, staging_table, state, last_error, created_at, updated_at
            FROM pipeline.batches
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Batch::try_from).collect()
    }

    /// Batches that came from `source_path`, newest first.
    pub async fn for_source(&self, source_path: &std::path::Path) -> PipelineResult<Vec<Batch>> {
        let rows: Vec<BatchRow> = sqlx::query_as(
            r#"
            SELECT batch_id, source_path, staging_table, state, last_error, created_at, updated_at
            FROM pipeline.batches
            WHERE source_path = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(source_path.to_string_lossy().as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Batch::try_from).collect()
    }
}
