//! cabflow: CSV trip ingestion pipeline
//!
//! Trip files dropped into an intake directory move through four stages,
//! each fed by its own queue topic:
//!
//! - **Stager** (`new-data`): bulk-copies the file into a fresh staging table
//! - **Cleaner** (`staged-data`): moves invalid rows to quarantine
//! - **Loader** (`cleaned-data`): inserts typed rows into the canonical table
//! - **Finalizer** (`loaded-data`): drops the staging table
//!
//! Stages hand over nothing but a file path or a table name. The queue is
//! at-least-once, so every stage is written to tolerate redelivery.
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod markers;
pub mod pipeline;
pub mod queue;
pub mod schema;
pub mod stages;
pub mod staging;
pub mod tracker;
pub mod trigger;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::Pipeline;

/// Embedded SQL migrations for the pipeline schema
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
