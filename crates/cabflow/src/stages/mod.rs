//! Stage handlers
//!
//! One handler per queue topic. Every handler receives a single string
//! payload, does its work against the store, and enqueues the next topic on
//! success. Errors are returned to the queue worker, which owns redelivery.
//!
//! - **stager**: file -> staging table (`new-data`)
//! - **cleaner**: invalid rows -> quarantine (`staged-data`)
//! - **loader**: staging -> canonical table (`cleaned-data`)
//! - **finalizer**: drops the staging table (`loaded-data`)

pub mod cleaner;
pub mod finalizer;
pub mod loader;
pub mod stager;

pub use cleaner::Cleaner;
pub use finalizer::Finalizer;
pub use loader::Loader;
pub use stager::Stager;

use tracing::warn;

use crate::error::PipelineResult;
use crate::queue::Job;
use crate::schema::TableName;

/// Staging table carried by `job`, rejecting anything that is not one.
pub(crate) fn staging_payload(stage: &'static str, job: &Job) -> PipelineResult<TableName> {
    TableName::parse_staging(&job.payload).inspect_err(|e| {
        warn!(stage, payload = %job.payload, error = %e, "Rejected job payload");
    })
}
