//! Validated record ingestion for small lookup tables
//!
//! Every line goes through parse, validate and transform before any row is
//! written. Invalid lines are dropped and counted. The valid records are then
//! inserted into staging as one batch: either every one of them lands, or the
//! batch is rolled back and the refresh fails. Only a fully successful batch
//! is promoted over live.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::bulk_swap::promote;
use super::{ProgressCallback, RefreshSummary};
use crate::error::{RefreshError, Result, StoreError, ValidationError};
use crate::store::{SqlValue, TablePair, TableStore, FIELD_DELIMITER};

/// One input line split into positional fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line number within its file
    pub line: u64,
    pub fields: Vec<String>,
}

impl RawRecord {
    pub fn parse(line_number: u64, line: &str) -> Self {
        Self {
            line: line_number,
            fields: line
                .trim_end_matches(['\n', '\r'])
                .split(FIELD_DELIMITER)
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Shape and rules of one kind of lookup table
pub trait LookupSchema: Send + Sync {
    /// A record that passed validation and carries its provenance
    type Record: Debug + Clone + Send + Sync;

    /// Dataset name used in logs and the status table
    fn dataset(&self) -> &'static str;

    /// Target columns, in the order [`LookupSchema::to_row`] fills them
    fn columns(&self) -> &'static [&'static str];

    fn validate(&self, raw: &RawRecord) -> std::result::Result<(), ValidationError>;

    fn transform(&self, raw: RawRecord, language_code: &str, at: DateTime<Utc>) -> Self::Record;

    fn to_row(&self, record: &Self::Record) -> Vec<SqlValue>;
}

/// Language code carried in a lookup file name, e.g. `featureCodes_en.txt` → `en`
pub fn language_code(path: &Path) -> Result<String> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    match stem.rsplit_once('_') {
        Some((prefix, code)) if !prefix.is_empty() && !code.is_empty() => Ok(code.to_string()),
        _ => Err(RefreshError::Provenance(file_name)),
    }
}

/// Valid records and rejection count gathered from the input files
#[derive(Debug, Clone)]
pub struct PreparedRecords<R> {
    pub records: Vec<R>,
    pub rejected: u64,
}

/// Refreshes one lookup table from a set of files
pub struct LookupPipeline<S: LookupSchema> {
    store: Arc<dyn TableStore>,
    schema: S,
    pair: TablePair,
    insert_timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl<S: LookupSchema> LookupPipeline<S> {
    pub fn new(
        store: Arc<dyn TableStore>,
        schema: S,
        pair: TablePair,
        insert_timeout: Duration,
    ) -> Self {
        Self {
            store,
            schema,
            pair,
            insert_timeout,
            progress: None,
        }
    }

    /// Report per-file parsing and batch insertion progress to `progress`
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, fraction: f64, message: &str) {
        if let Some(progress) = &self.progress {
            progress(fraction, message);
        }
    }

    /// Parse, validate and transform every line of every file
    ///
    /// Blank lines are skipped without counting. A file that cannot be read or
    /// whose name carries no language code fails the whole run.
    pub async fn prepare(&self, files: &[PathBuf]) -> Result<PreparedRecords<S::Record>> {
        let now = Utc::now();
        let mut prepared = PreparedRecords {
            records: Vec::new(),
            rejected: 0,
        };

        for (file_index, path) in files.iter().enumerate() {
            let language = language_code(path)?;
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RefreshError::LookupFile {
                    path: path.clone(),
                    source,
                })?;

            let mut file_rejected = 0u64;
            for (index, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let raw = RawRecord::parse(index as u64 + 1, line);
                match self.schema.validate(&raw) {
                    Ok(()) => prepared
                        .records
                        .push(self.schema.transform(raw, &language, now)),
                    Err(e) => {
                        debug!(
                            file = %path.display(),
                            line = raw.line,
                            error = %e,
                            "Dropping invalid lookup line"
                        );
                        file_rejected += 1;
                    }
                }
            }

            if file_rejected > 0 {
                warn!(
                    file = %path.display(),
                    rejected = file_rejected,
                    "Lookup file had invalid lines"
                );
            }
            prepared.rejected += file_rejected;

            self.report(
                (file_index + 1) as f64 / files.len() as f64,
                &format!("Parsed {}", path.display()),
            );
        }

        Ok(prepared)
    }

    /// Load `files` into a fresh staging table; does not promote
    ///
    /// Returns a summary whose `success` is true only if every valid record
    /// was inserted. A failed batch leaves staging empty. `attempted` counts
    /// every non-blank line, so it equals `accepted + rejected`.
    #[instrument(skip(self, files), fields(dataset = self.schema.dataset(), table = %self.pair.live))]
    pub async fn run(&self, files: &[PathBuf]) -> Result<RefreshSummary> {
        let started = Instant::now();
        let staging = &self.pair.staging;
        let staging_error = |source: StoreError| RefreshError::Staging {
            table: staging.clone(),
            source,
        };

        self.store
            .drop_table_if_exists(staging)
            .await
            .map_err(staging_error)?;
        self.store
            .create_table_like(&self.pair.live, staging)
            .await
            .map_err(staging_error)?;

        let prepared = self.prepare(files).await?;
        let rows: Vec<Vec<SqlValue>> = prepared
            .records
            .iter()
            .map(|record| self.schema.to_row(record))
            .collect();
        let valid = rows.len() as u64;

        let insert = self
            .store
            .insert_rows(staging, self.schema.columns(), &rows);
        let report = match tokio::time::timeout(self.insert_timeout, insert).await {
            Ok(result) => result.map_err(|source| RefreshError::Insert {
                table: staging.clone(),
                source,
            })?,
            Err(_) => {
                return Err(RefreshError::Timeout {
                    operation: "Lookup insert",
                    table: staging.clone(),
                    secs: self.insert_timeout.as_secs(),
                })
            }
        };

        if report.failed > 0 {
            error!(
                table = %staging,
                inserted = report.inserted,
                failed = report.failed,
                total = valid,
                "Lookup insert completed with errors; batch rolled back"
            );
            for sample in &report.sample_errors {
                error!(table = %staging, error = %sample, "Sample error");
            }
        }

        let inserted = report.inserted as u64;
        let success = report.committed && inserted == valid && valid > 0;
        if valid == 0 {
            warn!(table = %staging, "No valid lookup records; refusing to replace live table");
        }

        let summary = RefreshSummary {
            table: self.pair.live.clone(),
            attempted: valid + prepared.rejected,
            accepted: inserted,
            rejected: prepared.rejected + report.failed as u64,
            elapsed: started.elapsed(),
            success,
        };
        self.report(1.0, &format!("Inserted {} of {} records into {}", inserted, valid, staging));
        info!(summary = %summary.summary(), "Lookup load finished");
        Ok(summary)
    }

    /// Promote the loaded staging table over live
    pub async fn promote(&self) -> Result<()> {
        promote(self.store.as_ref(), &self.pair)
            .await
            .map_err(|source| RefreshError::Swap {
                live: self.pair.live.clone(),
                staging: self.pair.staging.clone(),
                source,
            })
    }

    /// Load and, if the load fully succeeded, promote
    pub async fn refresh(&self, files: &[PathBuf]) -> Result<RefreshSummary> {
        let summary = self.run(files).await?;
        if summary.success {
            self.promote().await?;
            info!(table = %self.pair.live, "Lookup table promoted");
        } else {
            warn!(table = %self.pair.live, "Lookup table left unchanged");
        }
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_language_code() {
        assert_eq!(
            language_code(Path::new("/data/featureCodes_en.txt")).unwrap(),
            "en"
        );
        assert_eq!(
            language_code(Path::new("feature_codes_nb.txt")).unwrap(),
            "nb"
        );
        assert_eq!(language_code(Path::new("featureCodes_zh")).unwrap(), "zh");
    }

    #[test]
    fn test_language_code_missing() {
        for name in ["featureCodes.txt", "featureCodes_.txt", "_en.txt"] {
            let err = language_code(Path::new(name)).unwrap_err();
            assert!(matches!(err, RefreshError::Provenance(ref n) if n == name));
        }
    }

    #[test]
    fn test_raw_record_parse() {
        let raw = RawRecord::parse(4, "A.ADM1\tname\t\r\n");
        assert_eq!(raw.line, 4);
        assert_eq!(raw.fields, vec!["A.ADM1", "name", ""]);
    }
}
