//! Postgres table store
//!
//! Bulk loads stream the master extract through `COPY .. FROM STDIN`. The
//! file is sent in CSV mode with a tab delimiter and a quote character that
//! never occurs in the extracts, so quotes and backslashes in place names load
//! verbatim and empty fields load as NULL.
//!
//! Promotion renames live to a retired name, staging to live, and drops the
//! retired table, all inside one transaction. Readers block on the rename lock
//! and then see the new table; they never find the name missing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use super::{
    validate_identifier, ColumnDef, ColumnMapping, DeferredIndexes, IndexDefinition,
    InsertReport, SqlValue, TablePair, TableStore, MAX_SAMPLE_ERRORS,
};
use crate::error::StoreError;

/// Bytes buffered before each `COPY` chunk is sent
const COPY_CHUNK_BYTES: usize = 1 << 20;

/// Quote character for CSV-mode `COPY`; SOH never appears in the extracts
const COPY_QUOTE: &str = r"E'\x01'";

/// Double-quote a validated identifier
fn quote(name: &str) -> Result<String, StoreError> {
    validate_identifier(name).map_err(StoreError::InvalidIdentifier)?;
    Ok(format!("\"{}\"", name))
}

/// [`TableStore`] backed by a Postgres pool
#[derive(Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Sequences owned by columns of `table`, as (sequence, column) pairs
    async fn owned_sequences(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let owned = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT s.relname::text, a.attname::text
            FROM pg_depend d
            JOIN pg_class s ON s.oid = d.objid AND s.relkind = 'S'
            JOIN pg_class t ON t.oid = d.refobjid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid
            WHERE t.relname = $1
              AND n.nspname = current_schema()
              AND d.deptype = 'a'
            "#,
        )
        .bind(table)
        .fetch_all(&mut **tx)
        .await?;

        Ok(owned)
    }

    /// Index names on `table`, primary and constraint-backed included
    async fn index_names(
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
    ) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT i.relname::text
            FROM pg_index x
            JOIN pg_class i ON i.oid = x.indexrelid
            JOIN pg_class t ON t.oid = x.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE t.relname = $1 AND n.nspname = current_schema()
            ORDER BY i.relname
            "#,
        )
        .bind(table)
        .fetch_all(&mut **tx)
        .await?;

        Ok(names)
    }

    fn copy_statement(table: &str, mapping: &ColumnMapping) -> Result<String, StoreError> {
        let columns = mapping
            .columns()
            .into_iter()
            .map(quote)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, DELIMITER E'\\t', QUOTE {})",
            quote(table)?,
            columns.join(", "),
            COPY_QUOTE
        ))
    }

    /// `INSERT` for one row; nulls are inlined so untyped parameters never meet typed columns
    fn insert_statement(
        table: &str,
        columns: &[String],
        row: &[SqlValue],
    ) -> Result<String, StoreError> {
        let mut placeholders = Vec::with_capacity(row.len());
        let mut next = 1;
        for value in row {
            if let SqlValue::Null = value {
                placeholders.push("NULL".to_string());
            } else {
                placeholders.push(format!("${}", next));
                next += 1;
            }
        }

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table)?,
            columns.join(", "),
            placeholders.join(", ")
        ))
    }

    async fn insert_one(
        tx: &mut Transaction<'_, Postgres>,
        statement: &str,
        row: &[SqlValue],
    ) -> Result<(), sqlx::Error> {
        let mut query = sqlx::query(statement);
        for value in row {
            query = match value {
                SqlValue::Text(text) => query.bind(text.clone()),
                SqlValue::Timestamp(at) => query.bind(*at),
                SqlValue::Null => query,
            };
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relname = $1
                  AND n.nspname = current_schema()
                  AND c.relkind IN ('r', 'p')
            )
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn drop_table_if_exists(&self, table: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(table)?))
            .execute(&self.pool)
            .await?;
        debug!(table = %table, "Dropped table if present");
        Ok(())
    }

    async fn create_table_like(&self, source: &str, target: &str) -> Result<(), StoreError> {
        if !self.table_exists(source).await? {
            return Err(StoreError::MissingTable(source.to_string()));
        }
        if self.table_exists(target).await? {
            return Err(StoreError::TableExists(target.to_string()));
        }

        sqlx::query(&format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            quote(target)?,
            quote(source)?
        ))
        .execute(&self.pool)
        .await?;

        info!(source = %source, target = %target, "Created table from template");
        Ok(())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, bool)>(
            r#"
            SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = $1
              AND n.nspname = current_schema()
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY a.attnum
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::MissingTable(table.to_string()));
        }

        Ok(rows
            .into_iter()
            .map(|(name, data_type, nullable)| ColumnDef {
                name,
                data_type,
                nullable,
            })
            .collect())
    }

    async fn defer_indexes(&self, table: &str) -> Result<DeferredIndexes, StoreError> {
        // Primary keys and constraint-backed indexes stay: dropping them would drop the constraint
        let indexes = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT i.relname::text, pg_get_indexdef(x.indexrelid)
            FROM pg_index x
            JOIN pg_class i ON i.oid = x.indexrelid
            JOIN pg_class t ON t.oid = x.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE t.relname = $1
              AND n.nspname = current_schema()
              AND NOT x.indisprimary
              AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = x.indexrelid)
            ORDER BY i.relname
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut deferred = DeferredIndexes::default();
        for (name, definition) in indexes {
            sqlx::query(&format!("DROP INDEX {}", quote(&name)?))
                .execute(&self.pool)
                .await?;
            debug!(table = %table, index = %name, "Deferred index");
            deferred.indexes.push(IndexDefinition { name, definition });
        }

        info!(
            table = %table,
            count = deferred.indexes.len(),
            "Deferred secondary indexes"
        );
        Ok(deferred)
    }

    async fn rebuild_indexes(
        &self,
        table: &str,
        deferred: &DeferredIndexes,
    ) -> Result<(), StoreError> {
        for index in &deferred.indexes {
            sqlx::query(&index.definition).execute(&self.pool).await?;
            debug!(table = %table, index = %index.name, "Rebuilt index");
        }

        info!(
            table = %table,
            count = deferred.indexes.len(),
            "Rebuilt secondary indexes"
        );
        Ok(())
    }

    async fn bulk_load_file(
        &self,
        table: &str,
        path: &Path,
        mapping: &ColumnMapping,
        loaded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let io_error = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let mut reader = BufReader::new(file);
        let stamp = loaded_at.to_rfc3339();

        let statement = Self::copy_statement(table, mapping)?;
        let mut conn = self.pool.acquire().await?;
        let mut copy = conn.copy_in_raw(&statement).await?;

        let mut raw = Vec::new();
        let mut chunk: Vec<u8> = Vec::with_capacity(COPY_CHUNK_BYTES + 4096);
        let mut line_number: u64 = 0;

        loop {
            raw.clear();
            let read = match reader.read_until(b'\n', &mut raw).await {
                Ok(read) => read,
                Err(e) => {
                    if let Err(abort_err) = copy.abort("extract read failed").await {
                        warn!(error = %abort_err, "COPY abort reported an error");
                    }
                    return Err(io_error(e));
                }
            };
            if read == 0 {
                break;
            }
            line_number += 1;

            let rendered = std::str::from_utf8(&raw)
                .map_err(|e| {
                    io_error(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("line {}: {}", line_number, e),
                    ))
                })
                .and_then(|line| mapping.render_line(line_number, line, &stamp));

            let rendered = match rendered {
                Ok(rendered) => rendered,
                Err(e) => {
                    error!(table = %table, line = line_number, error = %e, "Rejecting extract");
                    if let Err(abort_err) = copy.abort(e.to_string()).await {
                        warn!(error = %abort_err, "COPY abort reported an error");
                    }
                    return Err(e);
                }
            };

            chunk.extend_from_slice(rendered.as_bytes());
            if chunk.len() >= COPY_CHUNK_BYTES {
                copy.send(std::mem::take(&mut chunk)).await?;
                chunk.reserve(COPY_CHUNK_BYTES + 4096);
            }
        }

        if !chunk.is_empty() {
            copy.send(chunk).await?;
        }

        let rows = copy.finish().await?;
        info!(table = %table, rows, lines = line_number, "Bulk load complete");
        Ok(rows)
    }

    async fn swap_tables(&self, pair: &TablePair) -> Result<(), StoreError> {
        let retired = pair.retired();
        let live = quote(&pair.live)?;
        let staging = quote(&pair.staging)?;
        let retired_quoted = quote(&retired)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", live, retired_quoted))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", staging, live))
            .execute(&mut *tx)
            .await?;

        // Staging defaults may still draw from sequences the retired table owns
        for (sequence, column) in Self::owned_sequences(&mut tx, &retired).await? {
            sqlx::query(&format!(
                "ALTER SEQUENCE {} OWNED BY {}.{}",
                quote(&sequence)?,
                live,
                quote(&column)?
            ))
            .execute(&mut *tx)
            .await?;
            debug!(sequence = %sequence, table = %pair.live, "Moved sequence ownership");
        }

        sqlx::query(&format!("DROP TABLE {}", retired_quoted))
            .execute(&mut *tx)
            .await?;

        // Index names follow the table so the next refresh's clone gets staging-prefixed names again
        for index in Self::index_names(&mut tx, &pair.live).await? {
            if let Some(rest) = index.strip_prefix(pair.staging.as_str()) {
                let renamed = format!("{}{}", pair.live, rest);
                sqlx::query(&format!(
                    "ALTER INDEX {} RENAME TO {}",
                    quote(&index)?,
                    quote(&renamed)?
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        info!(live = %pair.live, staging = %pair.staging, "Promoted staging table");
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<InsertReport, StoreError> {
        let quoted_columns = columns
            .iter()
            .map(|c| quote(c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = InsertReport {
            attempted: rows.len(),
            ..InsertReport::default()
        };

        let mut tx = self.pool.begin().await?;

        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                report.failed += 1;
                if report.sample_errors.len() < MAX_SAMPLE_ERRORS {
                    report.sample_errors.push(format!(
                        "row {}: {} values for {} columns",
                        index,
                        row.len(),
                        columns.len()
                    ));
                }
                continue;
            }

            // Savepoint per row so one rejection does not abort the transaction
            sqlx::query("SAVEPOINT row_savepoint").execute(&mut *tx).await?;

            let statement = Self::insert_statement(table, &quoted_columns, row)?;
            match Self::insert_one(&mut tx, &statement, row).await {
                Ok(()) => {
                    sqlx::query("RELEASE SAVEPOINT row_savepoint")
                        .execute(&mut *tx)
                        .await?;
                    report.inserted += 1;
                }
                Err(e) => {
                    sqlx::query("ROLLBACK TO SAVEPOINT row_savepoint")
                        .execute(&mut *tx)
                        .await?;
                    report.failed += 1;
                    debug!(table = %table, row = index, error = %e, "Row rejected");
                    if report.sample_errors.len() < MAX_SAMPLE_ERRORS {
                        report.sample_errors.push(format!("row {}: {}", index, e));
                    }
                }
            }
        }

        if report.failed == 0 {
            tx.commit().await?;
            report.committed = true;
        } else {
            tx.rollback().await?;
            warn!(
                table = %table,
                inserted = report.inserted,
                failed = report.failed,
                "Batch rolled back"
            );
        }

        Ok(report)
    }

    async fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", quote(table)?))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::StampedColumn;

    #[test]
    fn test_copy_statement() {
        let mapping = ColumnMapping::new(
            &["geoname_id", "name"],
            vec![StampedColumn::LoadTime("created_at".to_string())],
        );
        let sql = PgTableStore::copy_statement("geonames_place_staging", &mapping).unwrap();
        assert_eq!(
            sql,
            "COPY \"geonames_place_staging\" (\"geoname_id\", \"name\", \"created_at\") \
             FROM STDIN WITH (FORMAT csv, DELIMITER E'\\t', QUOTE E'\\x01')"
        );
    }

    #[test]
    fn test_insert_statement_inlines_nulls() {
        let columns = vec!["\"a\"".to_string(), "\"b\"".to_string(), "\"c\"".to_string()];
        let row = vec![
            SqlValue::Text("x".to_string()),
            SqlValue::Null,
            SqlValue::Text("y".to_string()),
        ];
        let sql = PgTableStore::insert_statement("lookup", &columns, &row).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"lookup\" (\"a\", \"b\", \"c\") VALUES ($1, NULL, $2)"
        );
    }

    #[test]
    fn test_quote_rejects_injection() {
        assert!(matches!(
            quote("places\"; DROP TABLE x; --"),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }
}
