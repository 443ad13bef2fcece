//! Cleaner: quarantine invalid rows
//!
//! A row is invalid when any of `trip_id`, `taxi_id`, `trip_start` or
//! `trip_end` is NULL, or when the trip ends before it starts. Invalid rows
//! move from the staging table to `pipeline.bad_trips` in one
//! `DELETE .. RETURNING` / `INSERT` statement, committed together with the
//! batch state. A redelivered job therefore either finds the move fully
//! applied (and moves nothing) or not applied at all. A batch the loader
//! has already picked up is left untouched.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::batch::BatchState;
use crate::error::PipelineResult;
use crate::queue::{Job, JobHandler, JobQueue, Topic};
use crate::schema::{staging_column_list, TableName};
use crate::tracker::BatchTracker;

/// Rows matching this predicate are moved to quarantine.
pub const INVALID_ROW_PREDICATE: &str = "trip_id IS NULL \
     OR taxi_id IS NULL \
     OR trip_start IS NULL \
     OR trip_end IS NULL \
     OR trip_end::timestamp < trip_start::timestamp";

pub struct Cleaner {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
}

impl Cleaner {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>) -> Self {
        Self { pool, queue }
    }

    /// Quarantine the invalid rows of `table`. Returns how many were moved.
    pub async fn clean(&self, table: &TableName) -> PipelineResult<u64> {
        let mut tx = self.pool.begin().await?;

        if let Some(state) = BatchTracker::lock_state(&mut *tx, table).await? {
            if state.is_past(BatchState::Cleaned) {
                info!(table = %table, state = %state, "Batch already past cleaning, nothing to do");
                tx.rollback().await?;
                return Ok(0);
            }
        }

        BatchTracker::transition(&mut *tx, table, BatchState::Cleaning).await?;
        let moved = sqlx::query(&quarantine_statement(table))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        BatchTracker::transition(&mut *tx, table, BatchState::Cleaned).await?;

        tx.commit().await?;

        info!(table = %table, quarantined = moved, "Cleaned staging table");

        self.queue.enqueue(Topic::CleanedData, &table.to_string()).await?;
        Ok(moved)
    }
}

#[async_trait]
impl JobHandler for Cleaner {
    fn stage(&self) -> &'static str {
        "cleaner"
    }

    async fn handle(&self, job: &Job) -> PipelineResult<()> {
        let table = super::staging_payload(self.stage(), job)?;
        self.clean(&table).await.map(|_| ())
    }
}

fn quarantine_statement(table: &TableName) -> String {
    let columns = staging_column_list();
    format!(
        "WITH bad AS (DELETE FROM {staging} WHERE {INVALID_ROW_PREDICATE} RETURNING {columns}) \
         INSERT INTO {quarantine} ({columns}) SELECT {columns} FROM bad",
        staging = table.quoted(),
        quarantine = TableName::quarantine().quoted(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchId;

    #[test]
    fn test_quarantine_statement_moves_in_one_statement() {
        let table = BatchId::parse("1234abcd").unwrap().staging_table();
        let sql = quarantine_statement(&table);

        assert!(sql.starts_with("WITH bad AS (DELETE FROM \"pipeline\".\"trips_staging_1234abcd\""));
        assert!(sql.contains("INSERT INTO \"pipeline\".\"bad_trips\" (trip_id, taxi_id,"));
        assert!(sql.contains("trip_end::timestamp < trip_start::timestamp"));
        assert!(sql.ends_with("FROM bad"));
    }
}
