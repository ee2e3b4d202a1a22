//! Staging table lifecycle for bulk loads
//!
//! ```text
//! Idle → StagingCreated → Loaded → IndexesRebuilt → Swapped → Done
//!   └──────────┴─────────────┴───────────┴─────────────┴──▶ Error
//! ```
//!
//! Live is only touched by the final promotion. A failed load leaves live as
//! it was and keeps staging around for inspection; the next run drops it. A
//! load that produced no rows counts as failed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};

use super::RefreshSummary;
use crate::error::{RefreshError, Result, StoreError};
use crate::store::{ColumnMapping, TablePair, TableStore};

/// Where a bulk load run currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    Idle,
    StagingCreated,
    Loaded,
    IndexesRebuilt,
    Swapped,
    Done,
    Error,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Idle => write!(f, "idle"),
            LoadState::StagingCreated => write!(f, "staging_created"),
            LoadState::Loaded => write!(f, "loaded"),
            LoadState::IndexesRebuilt => write!(f, "indexes_rebuilt"),
            LoadState::Swapped => write!(f, "swapped"),
            LoadState::Done => write!(f, "done"),
            LoadState::Error => write!(f, "error"),
        }
    }
}

/// Check that `pair.staging` can replace `pair.live`, then swap them
///
/// Both tables must exist with identical columns and the retired name must
/// be free. Nothing is renamed unless every check passes.
pub async fn promote(store: &dyn TableStore, pair: &TablePair) -> std::result::Result<(), StoreError> {
    if !store.table_exists(&pair.staging).await? {
        return Err(StoreError::MissingTable(pair.staging.clone()));
    }
    if !store.table_exists(&pair.live).await? {
        return Err(StoreError::MissingTable(pair.live.clone()));
    }
    let retired = pair.retired();
    if store.table_exists(&retired).await? {
        return Err(StoreError::TableExists(retired));
    }

    let live_columns = store.columns(&pair.live).await?;
    let staging_columns = store.columns(&pair.staging).await?;
    if live_columns != staging_columns {
        let detail = if live_columns.len() != staging_columns.len() {
            format!(
                "{} columns in live, {} in staging",
                live_columns.len(),
                staging_columns.len()
            )
        } else {
            live_columns
                .iter()
                .zip(&staging_columns)
                .find(|(l, s)| l != s)
                .map(|(l, s)| {
                    format!(
                        "live has {} {}, staging has {} {}",
                        l.name, l.data_type, s.name, s.data_type
                    )
                })
                .unwrap_or_default()
        };
        return Err(StoreError::SchemaMismatch {
            live: pair.live.clone(),
            staging: pair.staging.clone(),
            detail,
        });
    }

    store.swap_tables(pair).await
}

/// Drives one bulk load from master extract to promoted live table
pub struct BulkLoadSwap {
    store: Arc<dyn TableStore>,
    pair: TablePair,
    mapping: ColumnMapping,
    load_timeout: Duration,
    state: LoadState,
}

impl BulkLoadSwap {
    pub fn new(
        store: Arc<dyn TableStore>,
        pair: TablePair,
        mapping: ColumnMapping,
        load_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pair,
            mapping,
            load_timeout,
            state: LoadState::Idle,
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    fn advance(&mut self, next: LoadState) {
        debug!(table = %self.pair.live, from = %self.state, to = %next, "Load state");
        self.state = next;
    }

    /// Load `master` into staging and promote it over live
    ///
    /// `expected_lines` is the master's line count when known; it only feeds the summary.
    #[instrument(skip(self, master), fields(table = %self.pair.live))]
    pub async fn run(&mut self, master: &Path, expected_lines: Option<u64>) -> Result<RefreshSummary> {
        let started = Instant::now();
        match self.execute(master).await {
            Ok(rows) => {
                self.advance(LoadState::Done);
                let summary = RefreshSummary {
                    table: self.pair.live.clone(),
                    attempted: expected_lines.unwrap_or(rows),
                    accepted: rows,
                    rejected: 0,
                    elapsed: started.elapsed(),
                    success: true,
                };
                info!(summary = %summary.summary(), "Bulk refresh complete");
                Ok(summary)
            }
            Err(e) => {
                error!(
                    table = %self.pair.live,
                    state = %self.state,
                    error = %e,
                    "Bulk refresh failed; live table untouched"
                );
                self.advance(LoadState::Error);
                Err(e)
            }
        }
    }

    async fn execute(&mut self, master: &Path) -> Result<u64> {
        let staging = self.pair.staging.clone();
        let staging_error = |source: StoreError| RefreshError::Staging {
            table: staging.clone(),
            source,
        };

        self.store
            .drop_table_if_exists(&staging)
            .await
            .map_err(staging_error)?;
        self.store
            .create_table_like(&self.pair.live, &staging)
            .await
            .map_err(staging_error)?;
        let deferred = self
            .store
            .defer_indexes(&staging)
            .await
            .map_err(staging_error)?;
        self.advance(LoadState::StagingCreated);

        let load = self
            .store
            .bulk_load_file(&staging, master, &self.mapping, Utc::now());
        let rows = match tokio::time::timeout(self.load_timeout, load).await {
            Ok(result) => result.map_err(|source| RefreshError::Load {
                table: staging.clone(),
                source,
            })?,
            Err(_) => {
                return Err(RefreshError::Timeout {
                    operation: "Bulk load",
                    table: staging.clone(),
                    secs: self.load_timeout.as_secs(),
                })
            }
        };
        if rows == 0 {
            return Err(RefreshError::EmptyExtract {
                path: master.to_path_buf(),
                table: staging.clone(),
            });
        }
        info!(table = %staging, rows, "Staging table loaded");
        self.advance(LoadState::Loaded);

        self.store
            .rebuild_indexes(&staging, &deferred)
            .await
            .map_err(|source| RefreshError::Load {
                table: staging.clone(),
                source,
            })?;
        self.advance(LoadState::IndexesRebuilt);

        promote(self.store.as_ref(), &self.pair)
            .await
            .map_err(|source| RefreshError::Swap {
                live: self.pair.live.clone(),
                staging: staging.clone(),
                source,
            })?;
        self.advance(LoadState::Swapped);

        Ok(rows)
    }
}
