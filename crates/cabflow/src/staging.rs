//! Staging table manager
//!
//! Each batch gets its own table cloned from the template. Creation retries
//! with a fresh batch id on a name collision; dropping treats a missing
//! table as already dropped so the finalizer can be redelivered safely.

use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::batch::BatchId;
use crate::error::{PipelineError, PipelineResult};
use crate::schema::TableName;

/// SQLSTATE for `duplicate_table`
const DUPLICATE_TABLE: &str = "42P07";

/// Attempts at finding an unused batch id before giving up.
pub const MAX_CREATE_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct StagingTables {
    pool: PgPool,
}

impl StagingTables {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the staging table for `batch_id`.
    ///
    /// Returns the batch id actually used, which differs from the one passed
    /// in only if that name was already taken by a live table.
    pub async fn create(&self, batch_id: BatchId) -> PipelineResult<(BatchId, TableName)> {
        let template = TableName::template();
        let mut candidate = batch_id;

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let table = candidate.staging_table();
            let statement = format!("CREATE TABLE {} (LIKE {})", table.quoted(), template.quoted());

            match sqlx::query(&statement).execute(&self.pool).await {
                Ok(_) => {
                    info!(batch = %candidate, table = %table, "Created staging table");
                    return Ok((candidate, table));
                },
                Err(e) => {
                    let err = PipelineError::from(e);
                    if err.sqlstate().as_deref() != Some(DUPLICATE_TABLE) {
                        return Err(err);
                    }
                    warn!(
                        table = %table,
                        attempt,
                        "Staging table name already in use, drawing a new batch id"
                    );
                    candidate = BatchId::generate();
                },
            }
        }

        Err(PipelineError::StagingNameExhausted(MAX_CREATE_ATTEMPTS))
    }

    /// Drop a staging table. A table that no longer exists counts as dropped.
    pub async fn drop(&self, table: &TableName) -> PipelineResult<()> {
        if !table.is_staging() {
            return Err(PipelineError::NotStagingTable(table.to_string()));
        }

        let statement = format!("DROP TABLE IF EXISTS {}", table.quoted());
        sqlx::query(&statement).execute(&self.pool).await?;
        debug!(table = %table, "Dropped staging table");

        Ok(())
    }

    pub async fn exists(&self, table: &TableName) -> PipelineResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(table.schema())
        .bind(table.name())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Staging tables currently present, template excluded.
    pub async fn list(&self) -> PipelineResult<Vec<TableName>> {
        let names: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT table_schema::text, table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'pipeline' AND table_name LIKE 'trips\_staging\_%'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names
            .into_iter()
            .filter_map(|(schema, name)| TableName::new(&schema, &name).ok())
            .filter(TableName::is_staging)
            .collect())
    }
}
