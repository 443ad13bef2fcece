//! Finalizer: release the staging table
//!
//! Terminal stage. Dropping a table that is already gone counts as success,
//! so a redelivered job completes without error.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::batch::BatchState;
use crate::error::PipelineResult;
use crate::queue::{Job, JobHandler};
use crate::schema::TableName;
use crate::staging::StagingTables;
use crate::tracker::BatchTracker;

pub struct Finalizer {
    tables: StagingTables,
    tracker: BatchTracker,
}

impl Finalizer {
    pub fn new(pool: PgPool) -> Self {
        Self {
            tables: StagingTables::new(pool.clone()),
            tracker: BatchTracker::new(pool),
        }
    }

    pub async fn finalize(&self, table: &TableName) -> PipelineResult<()> {
        self.tables.drop(table).await?;
        self.tracker.set_state(table, BatchState::Dropped).await?;

        info!(table = %table, "Released staging table");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Finalizer {
    fn stage(&self) -> &'static str {
        "finalizer"
    }

    async fn handle(&self, job: &Job) -> PipelineResult<()> {
        let table = super::staging_payload(self.stage(), job)?;
        self.finalize(&table).await
    }
}
