//! Batch identity and lifecycle state
//!
//! A batch is one source file's journey through the stages. Its id is a
//! short random token; the staging table name is derived from it, so the
//! table name alone is enough to carry a batch between stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::schema::{TableName, STAGING_PREFIX};

/// Hex characters in a batch id. 32 bits of randomness; the staging table
/// manager retries on the rare collision with a live table.
pub const BATCH_ID_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(simple[..BATCH_ID_LEN].to_string())
    }

    pub fn parse(s: &str) -> PipelineResult<Self> {
        let valid = s.len() == BATCH_ID_LEN
            && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(PipelineError::InvalidBatchId(s.to_string()))
        }
    }

    /// Recover the batch id from a staging table name.
    pub fn from_staging_table(table: &TableName) -> PipelineResult<Self> {
        let suffix = table
            .name()
            .strip_prefix(STAGING_PREFIX)
            .ok_or_else(|| PipelineError::NotStagingTable(table.to_string()))?;
        Self::parse(suffix)
    }

    /// Staging table owned by this batch.
    pub fn staging_table(&self) -> TableName {
        TableName::staging(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical batch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Staged,
    Cleaning,
    Cleaned,
    Loading,
    Loaded,
    Dropped,
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Staged => "staged",
            BatchState::Cleaning => "cleaning",
            BatchState::Cleaned => "cleaned",
            BatchState::Loading => "loading",
            BatchState::Loaded => "loaded",
            BatchState::Dropped => "dropped",
            BatchState::Failed => "failed",
        }
    }

    /// No stage will act on the batch again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Dropped | BatchState::Failed)
    }

    /// States a batch may be in when it moves to `self`. Transitions only go
    /// forward, so a redelivered stage cannot rewind a batch.
    pub fn predecessors(&self) -> &'static [BatchState] {
        use BatchState::*;
        match self {
            Staged => &[Staged],
            Cleaning => &[Staged, Cleaning],
            Cleaned => &[Staged, Cleaning, Cleaned],
            Loading => &[Cleaned, Loading],
            Loaded => &[Cleaned, Loading, Loaded],
            Dropped => &[Loaded, Dropped],
            Failed => &[Staged, Cleaning, Cleaned, Loading, Loaded, Failed],
        }
    }

    /// The batch has moved beyond `state`: a stage producing `state` has
    /// nothing left to do.
    pub fn is_past(&self, state: BatchState) -> bool {
        self.is_terminal() || self.rank() > state.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            BatchState::Staged => 0,
            BatchState::Cleaning => 1,
            BatchState::Cleaned => 2,
            BatchState::Loading => 3,
            BatchState::Loaded => 4,
            BatchState::Dropped | BatchState::Failed => 5,
        }
    }
}

impl FromStr for BatchState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(BatchState::Staged),
            "cleaning" => Ok(BatchState::Cleaning),
            "cleaned" => Ok(BatchState::Cleaned),
            "loading" => Ok(BatchState::Loading),
            "loaded" => Ok(BatchState::Loaded),
            "dropped" => Ok(BatchState::Dropped),
            "failed" => Ok(BatchState::Failed),
            other => Err(PipelineError::InvalidState(other.to_string())),
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch as recorded in `pipeline.batches`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub source_path: PathBuf,
    pub staging_table: TableName,
    pub state: BatchState,
    pub last_error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(id: BatchId, source_path: PathBuf) -> Self {
        let staging_table = id.staging_table();
        Self {
            id,
            source_path,
            staging_table,
            state: BatchState::Staged,
            last_error: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_valid_and_distinct() {
        let ids: HashSet<_> = (0..200).map(|_| BatchId::generate()).collect();
        assert_eq!(ids.len(), 200);
        for id in &ids {
            assert!(BatchId::parse(id.as_str()).is_ok());
        }
    }

    #[test]
    fn test_staging_table_roundtrips_to_batch_id() {
        let id = BatchId::parse("0a1b2c3d").unwrap();
        let table = id.staging_table();
        assert_eq!(table.to_string(), "pipeline.trips_staging_0a1b2c3d");
        assert!(table.is_staging());
        assert_eq!(BatchId::from_staging_table(&table).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!(BatchId::parse("0A1B2C3D").is_err());
        assert!(BatchId::parse("abc").is_err());
        assert!(BatchId::parse("zzzzzzzz").is_err());
    }

    #[test]
    fn test_state_strings() {
        for state in [
            BatchState::Staged,
            BatchState::Cleaning,
            BatchState::Cleaned,
            BatchState::Loading,
            BatchState::Loaded,
            BatchState::Dropped,
            BatchState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<BatchState>().unwrap(), state);
        }
        assert!(BatchState::Dropped.is_terminal());
        assert!(!BatchState::Loaded.is_terminal());
    }

    #[test]
    fn test_transitions_only_move_forward() {
        assert!(BatchState::Cleaned.predecessors().contains(&BatchState::Staged));
        assert!(!BatchState::Cleaned.predecessors().contains(&BatchState::Loaded));
        assert!(!BatchState::Loading.predecessors().contains(&BatchState::Dropped));
        assert!(!BatchState::Failed.predecessors().contains(&BatchState::Dropped));

        assert!(BatchState::Loaded.is_past(BatchState::Cleaned));
        assert!(BatchState::Dropped.is_past(BatchState::Loaded));
        assert!(BatchState::Failed.is_past(BatchState::Cleaned));
        assert!(!BatchState::Cleaned.is_past(BatchState::Cleaned));
        assert!(!BatchState::Staged.is_past(BatchState::Cleaned));
    }
}
