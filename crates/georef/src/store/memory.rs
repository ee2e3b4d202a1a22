//! In-process table store for tests
//!
//! Mirrors the Postgres store's observable contract: schema clones carry
//! staging-prefixed index names, bulk loads are all-or-nothing, empty extract
//! fields load as null, and batch inserts keep nothing unless every row
//! succeeds. Failures can be injected per operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use super::{
    ColumnDef, ColumnMapping, DeferredIndexes, IndexDefinition, InsertReport, SqlValue,
    StampedColumn, TablePair, TableStore, FIELD_DELIMITER, MAX_SAMPLE_ERRORS,
};
use crate::error::StoreError;

/// Operation that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateTable,
    BulkLoad,
    RebuildIndexes,
    Swap,
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<ColumnDef>,
    indexes: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, MemTable>,
    fail_points: HashSet<FailPoint>,
    rejected_values: HashSet<String>,
    bulk_load_delay: Option<Duration>,
}

/// [`TableStore`] keeping every table in memory
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    inner: Mutex<Inner>,
}

fn injected(point: FailPoint) -> StoreError {
    StoreError::Io {
        path: format!("<injected {:?} failure>", point).into(),
        source: std::io::Error::other("injected failure"),
    }
}

fn renamed_index(index: &str, from: &str, to: &str) -> String {
    match index.strip_prefix(from) {
        Some(rest) => format!("{}{}", to, rest),
        None => index.to_string(),
    }
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with text columns named `columns` and the given secondary indexes
    pub async fn create_table(&self, name: &str, columns: &[&str], indexes: &[&str]) {
        let columns = columns
            .iter()
            .map(|c| ColumnDef {
                name: c.to_string(),
                data_type: "text".to_string(),
                nullable: true,
            })
            .collect();
        self.create_table_with(name, columns, indexes).await;
    }

    async fn create_table_with(&self, name: &str, columns: Vec<ColumnDef>, indexes: &[&str]) {
        let table = MemTable {
            columns,
            indexes: indexes.iter().map(|i| i.to_string()).collect(),
            rows: Vec::new(),
        };
        self.inner.lock().await.tables.insert(name.to_string(), table);
    }

    /// Append rows without going through the batch contract
    pub async fn seed_rows(&self, name: &str, rows: Vec<Vec<SqlValue>>) {
        if let Some(table) = self.inner.lock().await.tables.get_mut(name) {
            table.rows.extend(rows);
        }
    }

    pub async fn rows(&self, name: &str) -> Option<Vec<Vec<SqlValue>>> {
        self.inner
            .lock()
            .await
            .tables
            .get(name)
            .map(|t| t.rows.clone())
    }

    pub async fn indexes(&self, name: &str) -> Option<Vec<String>> {
        self.inner
            .lock()
            .await
            .tables
            .get(name)
            .map(|t| t.indexes.clone())
    }

    /// Make the next call of `point` fail
    pub async fn fail_at(&self, point: FailPoint) {
        self.inner.lock().await.fail_points.insert(point);
    }

    /// Reject any inserted row holding this text value
    pub async fn reject_value(&self, value: &str) {
        self.inner.lock().await.rejected_values.insert(value.to_string());
    }

    /// Stall bulk loads for `delay` before reading the file
    pub async fn delay_bulk_load(&self, delay: Duration) {
        self.inner.lock().await.bulk_load_delay = Some(delay);
    }

    async fn take_failure(&self, point: FailPoint) -> Result<(), StoreError> {
        if self.inner.lock().await.fail_points.remove(&point) {
            Err(injected(point))
        } else {
            Ok(())
        }
    }

    fn row_values(line: &str, mapping: &ColumnMapping, loaded_at: DateTime<Utc>) -> Vec<SqlValue> {
        let mut values: Vec<SqlValue> = line
            .trim_end_matches(['\n', '\r'])
            .split(FIELD_DELIMITER)
            .map(|field| {
                if field.is_empty() {
                    SqlValue::Null
                } else {
                    SqlValue::Text(field.to_string())
                }
            })
            .collect();

        values.extend(mapping.stamped().iter().map(|column| match column {
            StampedColumn::LoadTime(_) => SqlValue::Timestamp(loaded_at),
            StampedColumn::Null(_) => SqlValue::Null,
        }));
        values
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.tables.contains_key(table))
    }

    async fn drop_table_if_exists(&self, table: &str) -> Result<(), StoreError> {
        self.inner.lock().await.tables.remove(table);
        Ok(())
    }

    async fn create_table_like(&self, source: &str, target: &str) -> Result<(), StoreError> {
        self.take_failure(FailPoint::CreateTable).await?;

        let mut inner = self.inner.lock().await;
        if inner.tables.contains_key(target) {
            return Err(StoreError::TableExists(target.to_string()));
        }
        let template = inner
            .tables
            .get(source)
            .ok_or_else(|| StoreError::MissingTable(source.to_string()))?;

        let clone = MemTable {
            columns: template.columns.clone(),
            indexes: template
                .indexes
                .iter()
                .map(|i| renamed_index(i, source, target))
                .collect(),
            rows: Vec::new(),
        };
        inner.tables.insert(target.to_string(), clone);
        Ok(())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    async fn defer_indexes(&self, table: &str) -> Result<DeferredIndexes, StoreError> {
        let mut inner = self.inner.lock().await;
        let target = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let indexes = std::mem::take(&mut target.indexes)
            .into_iter()
            .map(|name| IndexDefinition {
                definition: format!("CREATE INDEX {} ON {}", name, table),
                name,
            })
            .collect();
        Ok(DeferredIndexes { indexes })
    }

    async fn rebuild_indexes(
        &self,
        table: &str,
        deferred: &DeferredIndexes,
    ) -> Result<(), StoreError> {
        self.take_failure(FailPoint::RebuildIndexes).await?;

        let mut inner = self.inner.lock().await;
        let target = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        target
            .indexes
            .extend(deferred.indexes.iter().map(|i| i.name.clone()));
        Ok(())
    }

    async fn bulk_load_file(
        &self,
        table: &str,
        path: &Path,
        mapping: &ColumnMapping,
        loaded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let delay = self.inner.lock().await.bulk_load_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.take_failure(FailPoint::BulkLoad).await?;

        let io_error = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let mut lines = BufReader::new(file).lines();

        let mut loaded = Vec::new();
        let mut line_number = 0u64;
        while let Some(line) = lines.next_line().await.map_err(io_error)? {
            line_number += 1;
            mapping.render_line(line_number, &line, "")?;
            loaded.push(Self::row_values(&line, mapping, loaded_at));
        }

        let mut inner = self.inner.lock().await;
        let target = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        let count = loaded.len() as u64;
        target.rows.extend(loaded);
        Ok(count)
    }

    async fn swap_tables(&self, pair: &TablePair) -> Result<(), StoreError> {
        self.take_failure(FailPoint::Swap).await?;

        let mut inner = self.inner.lock().await;
        if !inner.tables.contains_key(&pair.live) {
            return Err(StoreError::MissingTable(pair.live.clone()));
        }
        let mut promoted = inner
            .tables
            .remove(&pair.staging)
            .ok_or_else(|| StoreError::MissingTable(pair.staging.clone()))?;

        promoted.indexes = promoted
            .indexes
            .iter()
            .map(|i| renamed_index(i, &pair.staging, &pair.live))
            .collect();
        inner.tables.insert(pair.live.clone(), promoted);
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<InsertReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let rejected = inner.rejected_values.clone();
        let target = inner
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let positions = columns
            .iter()
            .map(|c| {
                target
                    .columns
                    .iter()
                    .position(|def| def.name == *c)
                    .ok_or_else(|| StoreError::SchemaMismatch {
                        live: table.to_string(),
                        staging: table.to_string(),
                        detail: format!("no column '{}'", c),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = InsertReport {
            attempted: rows.len(),
            ..InsertReport::default()
        };
        let mut accepted = Vec::with_capacity(rows.len());

        for (index, row) in rows.iter().enumerate() {
            let reason = if row.len() != columns.len() {
                Some(format!("{} values for {} columns", row.len(), columns.len()))
            } else {
                row.iter().find_map(|value| match value {
                    SqlValue::Text(text) if rejected.contains(text) => {
                        Some(format!("value '{}' rejected", text))
                    }
                    _ => None,
                })
            };

            match reason {
                Some(reason) => {
                    report.failed += 1;
                    if report.sample_errors.len() < MAX_SAMPLE_ERRORS {
                        report.sample_errors.push(format!("row {}: {}", index, reason));
                    }
                }
                None => {
                    let mut stored = vec![SqlValue::Null; target.columns.len()];
                    for (value, position) in row.iter().zip(&positions) {
                        stored[*position] = value.clone();
                    }
                    accepted.push(stored);
                    report.inserted += 1;
                }
            }
        }

        if report.failed == 0 {
            target.rows.extend(accepted);
            report.committed = true;
        }
        Ok(report)
    }

    async fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }
}
