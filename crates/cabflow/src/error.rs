//! Pipeline error types

use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Not a staging table: {0}")]
    NotStagingTable(String),

    #[error("Could not allocate a unique staging table after {0} attempts")]
    StagingNameExhausted(u32),

    #[error("Invalid batch id: {0}")]
    InvalidBatchId(String),

    #[error("Invalid batch state: {0}")]
    InvalidState(String),

    #[error("Unknown queue topic: {0}")]
    UnknownTopic(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] cabflow_common::CommonError),
}

impl From<csv_async::Error> for PipelineError {
    fn from(err: csv_async::Error) -> Self {
        PipelineError::Csv(err.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        PipelineError::Csv(err.to_string())
    }
}

impl PipelineError {
    /// Postgres SQLSTATE of the underlying database error, if any.
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            PipelineError::Database(sqlx::Error::Database(db)) => {
                db.code().map(|code| code.into_owned())
            },
            _ => None,
        }
    }
}
