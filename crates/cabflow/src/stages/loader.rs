//! Loader: staging table -> canonical table
//!
//! Casts the text columns to their canonical types, derives the trip
//! duration range, and inserts with `ON CONFLICT (trip_id) DO NOTHING`.
//! Running it twice on the same table inserts nothing the second time, and
//! a batch that was already released is acknowledged without touching it.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::batch::BatchState;
use crate::error::PipelineResult;
use crate::queue::{Job, JobHandler, JobQueue, Topic};
use crate::schema::{TableName, PROVENANCE_COLUMN, TRIP_COLUMNS};
use crate::tracker::BatchTracker;

/// Canonical column -> expression over the staging row. Columns not listed
/// are copied as text.
const CASTS: &[(&str, &str)] = &[
    ("trip_start", "trip_start::timestamp"),
    ("trip_end", "trip_end::timestamp"),
    ("trip_seconds", "trip_seconds::int"),
    ("trip_miles", "trip_miles::float"),
    ("pickup_census_tract", "pickup_census_tract::bigint"),
    ("dropoff_census_tract", "dropoff_census_tract::bigint"),
    ("pickup_community_area", "pickup_community_area::int"),
    ("dropoff_community_area", "dropoff_community_area::int"),
    ("fare", "fare::float"),
    ("tips", "tips::float"),
    ("tolls", "tolls::float"),
    ("extras", "extras::float"),
    ("trip_total", "trip_total::float"),
    ("pickup_centroid_latitude", "pickup_centroid_latitude::float"),
    ("pickup_centroid_longitude", "pickup_centroid_longitude::float"),
    ("dropoff_centroid_latitude", "dropoff_centroid_latitude::float"),
    ("dropoff_centroid_longitude", "dropoff_centroid_longitude::float"),
];

/// Derived inclusive range over the trip's start and end.
const TRIP_DURATION: &str = "tsrange(trip_start::timestamp, trip_end::timestamp, '[]')";

pub struct Loader {
    pool: PgPool,
    queue: Arc<dyn JobQueue>,
}

impl Loader {
    pub fn new(pool: PgPool, queue: Arc<dyn JobQueue>) -> Self {
        Self { pool, queue }
    }

    /// Insert the rows of `table` into the canonical table. Returns the
    /// number of new records; rows whose `trip_id` already exists are skipped.
    pub async fn load(&self, table: &TableName) -> PipelineResult<u64> {
        let mut tx = self.pool.begin().await?;

        if let Some(state) = BatchTracker::lock_state(&mut *tx, table).await? {
            if state.is_past(BatchState::Loaded) {
                info!(table = %table, state = %state, "Batch already past loading, nothing to do");
                tx.rollback().await?;
                return Ok(0);
            }
        }

        BatchTracker::transition(&mut *tx, table, BatchState::Loading).await?;
        let inserted = sqlx::query(&load_statement(table))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        BatchTracker::transition(&mut *tx, table, BatchState::Loaded).await?;
        tx.commit().await?;

        info!(table = %table, inserted, "Loaded staging table into canonical table");

        self.queue.enqueue(Topic::LoadedData, &table.to_string()).await?;
        Ok(inserted)
    }
}

#[async_trait]
impl JobHandler for Loader {
    fn stage(&self) -> &'static str {
        "loader"
    }

    async fn handle(&self, job: &Job) -> PipelineResult<()> {
        let table = super::staging_payload(self.stage(), job)?;
        self.load(&table).await.map(|_| ())
    }
}

fn load_statement(table: &TableName) -> String {
    let mut targets: Vec<&str> = TRIP_COLUMNS.to_vec();
    targets.push("trip_duration");
    targets.push(PROVENANCE_COLUMN);

    let mut selects: Vec<&str> = TRIP_COLUMNS
        .iter()
        .map(|column| {
            CASTS
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, expr)| *expr)
                .unwrap_or(*column)
        })
        .collect();
    selects.push(TRIP_DURATION);
    selects.push(PROVENANCE_COLUMN);

    format!(
        "INSERT INTO {canonical} ({targets}) SELECT {selects} FROM {staging} \
         ON CONFLICT (trip_id) DO NOTHING",
        canonical = TableName::canonical().quoted(),
        targets = targets.join(", "),
        selects = selects.join(", "),
        staging = table.quoted(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchId;

    #[test]
    fn test_load_statement_casts_and_skips_conflicts() {
        let table = BatchId::parse("feedbeef").unwrap().staging_table();
        let sql = load_statement(&table);

        assert!(sql.starts_with("INSERT INTO \"pipeline\".\"trips\" (trip_id, taxi_id, trip_start"));
        assert!(sql.contains("trip_duration, source_path) SELECT trip_id, taxi_id, trip_start::timestamp"));
        assert!(sql.contains("pickup_census_tract::bigint"));
        assert!(sql.contains("payment_type, company, pickup_centroid_latitude::float"));
        assert!(sql.contains("tsrange(trip_start::timestamp, trip_end::timestamp, '[]'), source_path"));
        assert!(sql.contains("FROM \"pipeline\".\"trips_staging_feedbeef\""));
        assert!(sql.ends_with("ON CONFLICT (trip_id) DO NOTHING"));
    }

    #[test]
    fn test_every_cast_names_a_trip_column() {
        for (column, _) in CASTS {
            assert!(TRIP_COLUMNS.contains(column), "unknown column {column}");
        }
    }
}
