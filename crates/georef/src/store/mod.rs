//! Storage engine interface
//!
//! The refresh pipelines never talk SQL directly. They drive a [`TableStore`],
//! which exposes the handful of table-level operations a refresh needs:
//! cloning a table's schema, deferring and rebuilding secondary indexes, bulk
//! loading a delimited file, inserting validated rows, and atomically swapping
//! a staging table over its live twin.
//!
//! [`postgres::PgTableStore`] is the production implementation.
//! `memory::MemoryTableStore` (feature `test-utils`) keeps tables in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::StoreError;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;

pub use postgres::PgTableStore;

/// Field delimiter of every extract this crate reads
pub const FIELD_DELIMITER: char = '\t';

/// A live table and the staging twin that replaces it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePair {
    pub live: String,
    pub staging: String,
}

impl TablePair {
    pub fn new(live: impl Into<String>, staging: impl Into<String>) -> Self {
        Self {
            live: live.into(),
            staging: staging.into(),
        }
    }

    pub fn with_suffix(live: &str, suffix: &str) -> Self {
        Self::new(live, format!("{}{}", live, suffix))
    }

    /// Name the outgoing live table holds for the duration of a swap
    pub fn retired(&self) -> String {
        format!("{}_retired", self.live)
    }
}

/// Check that `name` is safe to splice into DDL as an unquoted identifier
pub fn validate_identifier(name: &str) -> Result<(), String> {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let ident = IDENT.get_or_init(|| {
        Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    });

    // Postgres truncates identifiers at 63 bytes; a truncated staging name could collide with live
    if name.len() > 63 {
        return Err(format!("Table name '{}' exceeds 63 bytes", name));
    }
    if !ident.is_match(name) {
        return Err(format!(
            "Table name '{}' must be lowercase letters, digits and underscores",
            name
        ));
    }
    Ok(())
}

/// One value bound into an inserted row
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Timestamp(DateTime<Utc>),
    Null,
}

/// Column name and type as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A secondary index dropped from staging before a bulk load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    /// Full `CREATE INDEX` statement used to rebuild it
    pub definition: String,
}

/// Indexes removed by [`TableStore::defer_indexes`], replayed by [`TableStore::rebuild_indexes`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredIndexes {
    pub indexes: Vec<IndexDefinition>,
}

/// Column filled by the loader rather than read from the extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampedColumn {
    /// Set to the time the load started
    LoadTime(String),
    /// Left null
    Null(String),
}

impl StampedColumn {
    fn name(&self) -> &str {
        match self {
            StampedColumn::LoadTime(name) | StampedColumn::Null(name) => name,
        }
    }
}

/// Maps positional extract fields, plus stamped trailing columns, onto table columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    input: Vec<String>,
    stamped: Vec<StampedColumn>,
}

impl ColumnMapping {
    pub fn new(input: &[&str], stamped: Vec<StampedColumn>) -> Self {
        Self {
            input: input.iter().map(|c| c.to_string()).collect(),
            stamped,
        }
    }

    /// Number of fields every input line must carry
    pub fn input_width(&self) -> usize {
        self.input.len()
    }

    /// Columns filled by the loader rather than read from input, in load order
    pub fn stamped(&self) -> &[StampedColumn] {
        &self.stamped
    }

    /// All target columns in load order
    pub fn columns(&self) -> Vec<&str> {
        self.input
            .iter()
            .map(String::as_str)
            .chain(self.stamped.iter().map(StampedColumn::name))
            .collect()
    }

    /// Check one extract line and append the stamped fields
    ///
    /// The returned line is newline-terminated and uses the same delimiter. A
    /// stamped null is rendered as an empty field, which a CSV-mode loader
    /// reads as NULL.
    pub fn render_line(
        &self,
        line_number: u64,
        line: &str,
        loaded_at: &str,
    ) -> Result<String, StoreError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let found = line.split(FIELD_DELIMITER).count();
        if found != self.input.len() {
            return Err(StoreError::MalformedLine {
                line: line_number,
                expected: self.input.len(),
                found,
            });
        }

        let mut rendered = String::with_capacity(line.len() + 40);
        rendered.push_str(line);
        for column in &self.stamped {
            rendered.push(FIELD_DELIMITER);
            if let StampedColumn::LoadTime(_) = column {
                rendered.push_str(loaded_at);
            }
        }
        rendered.push('\n');
        Ok(rendered)
    }
}

/// Outcome of an all-or-nothing batch insert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub attempted: usize,
    pub inserted: usize,
    pub failed: usize,
    /// Whether the batch was committed; false means nothing was kept
    pub committed: bool,
    /// First few per-row failure messages
    pub sample_errors: Vec<String>,
}

/// Number of per-row failure messages an [`InsertReport`] keeps
pub const MAX_SAMPLE_ERRORS: usize = 5;

/// Table-level operations a refresh needs from the storage engine
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    async fn drop_table_if_exists(&self, table: &str) -> Result<(), StoreError>;

    /// Create `target` with the columns, types, defaults, constraints and indexes of `source`
    async fn create_table_like(&self, source: &str, target: &str) -> Result<(), StoreError>;

    /// Columns of `table` in ordinal order
    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError>;

    /// Drop the secondary indexes of `table`, returning what is needed to rebuild them
    async fn defer_indexes(&self, table: &str) -> Result<DeferredIndexes, StoreError>;

    async fn rebuild_indexes(
        &self,
        table: &str,
        deferred: &DeferredIndexes,
    ) -> Result<(), StoreError>;

    /// Load every line of `path` into `table` as one unit; returns rows loaded
    ///
    /// Any malformed line rejects the whole file and loads nothing.
    async fn bulk_load_file(
        &self,
        table: &str,
        path: &Path,
        mapping: &ColumnMapping,
        loaded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Replace `pair.live` with `pair.staging` in one atomic step
    ///
    /// Concurrent readers see either the old live table or the new one, never
    /// a missing table. The outgoing table is dropped.
    async fn swap_tables(&self, pair: &TablePair) -> Result<(), StoreError>;

    /// Insert `rows` as one batch, isolating each row's failure
    ///
    /// The batch is committed only if every row succeeded; otherwise nothing is kept.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<InsertReport, StoreError>;

    async fn row_count(&self, table: &str) -> Result<u64, StoreError>;

    /// Insert a single row
    async fn insert_row(
        &self,
        table: &str,
        columns: &[&str],
        row: Vec<SqlValue>,
    ) -> Result<(), StoreError> {
        let report = self.insert_rows(table, columns, &[row]).await?;
        if report.committed {
            Ok(())
        } else {
            Err(StoreError::RowRejected {
                table: table.to_string(),
                row: 0,
                reason: report.sample_errors.join("; "),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn mapping() -> ColumnMapping {
        ColumnMapping::new(
            &["id", "name", "code"],
            vec![
                StampedColumn::LoadTime("created_at".to_string()),
                StampedColumn::Null("updated_at".to_string()),
            ],
        )
    }

    #[test]
    fn test_render_line_appends_stamps() {
        let rendered = mapping()
            .render_line(1, "7\tParis\tPPLC\n", "2026-10-19T00:00:00+00:00")
            .unwrap();
        assert_eq!(rendered, "7\tParis\tPPLC\t2026-10-19T00:00:00+00:00\t\n");
    }

    #[test]
    fn test_render_line_strips_crlf_and_keeps_empty_fields() {
        let rendered = mapping().render_line(3, "7\t\tPPLC\r\n", "ts").unwrap();
        assert_eq!(rendered, "7\t\tPPLC\tts\t\n");
    }

    #[test]
    fn test_render_line_rejects_wrong_width() {
        let err = mapping().render_line(9, "7\tParis", "ts").unwrap_err();
        assert!(matches!(
            err,
            StoreError::MalformedLine {
                line: 9,
                expected: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn test_columns_in_load_order() {
        assert_eq!(
            mapping().columns(),
            vec!["id", "name", "code", "created_at", "updated_at"]
        );
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("geonames_place_staging").is_ok());
        assert!(validate_identifier("Places").is_err());
        assert!(validate_identifier("places\"; drop").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_table_pair_names() {
        let pair = TablePair::with_suffix("geonames_place", "_staging");
        assert_eq!(pair.staging, "geonames_place_staging");
        assert_eq!(pair.retired(), "geonames_place_retired");
    }
}
