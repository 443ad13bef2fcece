//! Table identifiers and the fixed column layout of trip rows
//!
//! Table names are the only SQL identifiers the pipeline composes at
//! runtime (one staging table per batch). They are validated against a
//! strict allow-list and always rendered quoted; row values never pass
//! through here, they are bound as statement parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};

/// Schema holding every pipeline table.
pub const PIPELINE_SCHEMA: &str = "pipeline";

/// Template cloned for each staging table.
pub const TEMPLATE_TABLE: &str = "trips_staging_template";

/// Canonical, deduplicated destination.
pub const CANONICAL_TABLE: &str = "trips";

/// Destination for rows failing validation.
pub const QUARANTINE_TABLE: &str = "bad_trips";

/// Prefix of every per-batch staging table.
pub const STAGING_PREFIX: &str = "trips_staging_";

/// Provenance column appended to every staged row.
pub const PROVENANCE_COLUMN: &str = "source_path";

/// Columns of a raw trip row, in file order. The provenance column follows.
pub const TRIP_COLUMNS: [&str; 23] = [
    "trip_id",
    "taxi_id",
    "trip_start",
    "trip_end",
    "trip_seconds",
    "trip_miles",
    "pickup_census_tract",
    "dropoff_census_tract",
    "pickup_community_area",
    "dropoff_community_area",
    "fare",
    "tips",
    "tolls",
    "extras",
    "trip_total",
    "payment_type",
    "company",
    "pickup_centroid_latitude",
    "pickup_centroid_longitude",
    "pickup_centroid_location",
    "dropoff_centroid_latitude",
    "dropoff_centroid_longitude",
    "dropoff_centroid_location",
];

/// Postgres truncates identifiers beyond this many bytes.
const MAX_IDENT_LEN: usize = 63;

/// Comma separated staging column list, provenance included.
pub fn staging_column_list() -> String {
    let mut columns = TRIP_COLUMNS.join(", ");
    columns.push_str(", ");
    columns.push_str(PROVENANCE_COLUMN);
    columns
}

/// A validated `schema.table` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: String,
    name: String,
}

impl TableName {
    pub fn new(schema: &str, name: &str) -> PipelineResult<Self> {
        validate_ident(schema)?;
        validate_ident(name)?;
        Ok(Self {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }

    /// A table in the pipeline schema.
    pub fn pipeline(name: &str) -> PipelineResult<Self> {
        Self::new(PIPELINE_SCHEMA, name)
    }

    pub fn template() -> Self {
        Self::known(TEMPLATE_TABLE)
    }

    pub fn canonical() -> Self {
        Self::known(CANONICAL_TABLE)
    }

    pub fn quarantine() -> Self {
        Self::known(QUARANTINE_TABLE)
    }

    /// Staging table for a batch id. Batch ids are validated lowercase hex,
    /// so the result is always a legal identifier.
    pub(crate) fn staging(batch_id: &str) -> Self {
        Self {
            schema: PIPELINE_SCHEMA.to_string(),
            name: format!("{STAGING_PREFIX}{batch_id}"),
        }
    }

    fn known(name: &'static str) -> Self {
        Self {
            schema: PIPELINE_SCHEMA.to_string(),
            name: name.to_string(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted form for splicing into a statement.
    pub fn quoted(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }

    /// True for per-batch staging tables, false for the template and every
    /// long-lived table.
    pub fn is_staging(&self) -> bool {
        self.schema == PIPELINE_SCHEMA
            && self.name != TEMPLATE_TABLE
            && self.name.starts_with(STAGING_PREFIX)
            && self.name.len() > STAGING_PREFIX.len()
    }

    /// Parse a queue payload and insist it names a staging table.
    pub fn parse_staging(payload: &str) -> PipelineResult<Self> {
        let table: TableName = payload.parse()?;
        if table.is_staging() {
            Ok(table)
        } else {
            Err(PipelineError::NotStagingTable(payload.to_string()))
        }
    }
}

impl FromStr for TableName {
    type Err = PipelineError;

    /// Accepts `schema.table` or a bare `table` in the pipeline schema.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('.') {
            Some((schema, name)) => TableName::new(schema, name),
            None => TableName::pipeline(s.trim()),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

// TableName is serialized as its dotted form
impl Serialize for TableName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TableName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn validate_ident(ident: &str) -> PipelineResult<()> {
    let mut chars = ident.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && ident.len() <= MAX_IDENT_LEN {
        Ok(())
    } else {
        Err(PipelineError::InvalidIdentifier(ident.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified_and_bare() {
        let qualified: TableName = "pipeline.trips_staging_ab12cd34".parse().unwrap();
        let bare: TableName = "trips_staging_ab12cd34".parse().unwrap();
        assert_eq!(qualified, bare);
        assert_eq!(qualified.to_string(), "pipeline.trips_staging_ab12cd34");
        assert_eq!(qualified.quoted(), "\"pipeline\".\"trips_staging_ab12cd34\"");
    }

    #[test]
    fn test_rejects_injection_attempts() {
        for bad in [
            "pipeline.trips; DROP TABLE pipeline.trips",
            "pipeline.\"trips\"",
            "Pipeline.Trips",
            "pipeline.",
            "1table",
            "pipeline.trips staging",
        ] {
            assert!(bad.parse::<TableName>().is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn test_rejects_overlong_identifier() {
        let long = "a".repeat(64);
        assert!(TableName::pipeline(&long).is_err());
        assert!(TableName::pipeline(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_staging_guard() {
        assert!(TableName::parse_staging("pipeline.trips_staging_0011aabb").is_ok());
        assert!(TableName::parse_staging("pipeline.trips").is_err());
        assert!(TableName::parse_staging("pipeline.bad_trips").is_err());
        assert!(TableName::parse_staging("pipeline.trips_staging_template").is_err());
        assert!(TableName::parse_staging("public.trips_staging_0011aabb").is_err());
        assert!(TableName::parse_staging("pipeline.trips_staging_").is_err());
    }

    #[test]
    fn test_staging_column_list_ends_with_provenance() {
        let list = staging_column_list();
        assert!(list.starts_with("trip_id, taxi_id"));
        assert!(list.ends_with(", source_path"));
        assert_eq!(list.split(", ").count(), TRIP_COLUMNS.len() + 1);
    }
}
