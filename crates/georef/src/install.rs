//! Install orchestration
//!
//! Runs refreshes in a fixed order under one lifecycle record and, when given
//! a pool, under a session-level Postgres advisory lock so two installers
//! never work on the same staging/live pairs at once.

use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RefreshConfig;
use crate::error::{RefreshError, Result};
use crate::refresh::feature_codes::FeatureCodeSchema;
use crate::refresh::lookup::LookupPipeline;
use crate::refresh::places::PlacesRefresh;
use crate::refresh::status::RefreshStatusTracker;
use crate::refresh::{ProgressCallback, RefreshSummary};
use crate::store::TableStore;

/// Advisory lock key held for the duration of a run
pub const INSTALL_LOCK_KEY: i64 = 0x6765_6f72_6566;

/// Lifecycle record covering a full install
pub const INSTALL_DATASET: &str = "geonames";

/// Per-table outcomes of an install
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallReport {
    pub places: Option<RefreshSummary>,
    pub feature_codes: Option<RefreshSummary>,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        [&self.places, &self.feature_codes]
            .into_iter()
            .flatten()
            .all(RefreshSummary::is_success)
    }
}

pub struct Installer {
    store: Arc<dyn TableStore>,
    tracker: RefreshStatusTracker,
    config: RefreshConfig,
    lock_pool: Option<PgPool>,
}

impl Installer {
    pub fn new(
        store: Arc<dyn TableStore>,
        tracker: RefreshStatusTracker,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            tracker,
            config,
            lock_pool: None,
        }
    }

    /// Hold the install advisory lock on a connection from `pool` during runs
    pub fn with_lock(mut self, pool: PgPool) -> Self {
        self.lock_pool = Some(pool);
        self
    }

    pub fn tracker(&self) -> &RefreshStatusTracker {
        &self.tracker
    }

    fn feature_code_pipeline(
        &self,
        progress: Option<&ProgressCallback>,
    ) -> LookupPipeline<FeatureCodeSchema> {
        let pipeline = LookupPipeline::new(
            self.store.clone(),
            FeatureCodeSchema,
            self.config.tables.feature_code_pair(),
            self.config.insert_timeout(),
        );
        match progress {
            Some(progress) => pipeline.with_progress(progress.clone()),
            None => pipeline,
        }
    }

    /// Refresh places, then feature codes, recorded under [`INSTALL_DATASET`]
    pub async fn install(
        &self,
        lookup_files: &[PathBuf],
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallReport> {
        self.tracked(INSTALL_DATASET, async {
            let mut report = InstallReport::default();

            let places = PlacesRefresh::new(self.store.clone(), self.config.clone())
                .run(progress)
                .await?;
            report.places = Some(places);

            let feature_codes = self
                .feature_code_pipeline(progress)
                .refresh(lookup_files)
                .await?;
            report.feature_codes = Some(feature_codes);

            Ok(report)
        })
        .await
    }

    /// Refresh only the places table
    pub async fn refresh_places(&self, progress: Option<&ProgressCallback>) -> Result<InstallReport> {
        let dataset = self.config.tables.places.clone();
        self.tracked(&dataset, async {
            let places = PlacesRefresh::new(self.store.clone(), self.config.clone())
                .run(progress)
                .await?;
            Ok(InstallReport {
                places: Some(places),
                ..InstallReport::default()
            })
        })
        .await
    }

    /// Refresh only the feature code table
    pub async fn refresh_lookups(
        &self,
        lookup_files: &[PathBuf],
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallReport> {
        let dataset = self.config.tables.feature_codes.clone();
        self.tracked(&dataset, async {
            let feature_codes = self
                .feature_code_pipeline(progress)
                .refresh(lookup_files)
                .await?;
            Ok(InstallReport {
                feature_codes: Some(feature_codes),
                ..InstallReport::default()
            })
        })
        .await
    }

    /// Run `work` under the lock, bracketed by lifecycle transitions
    async fn tracked<F>(&self, dataset: &str, work: F) -> Result<InstallReport>
    where
        F: Future<Output = Result<InstallReport>>,
    {
        let run_id = Uuid::new_v4();
        self.locked(async {
            self.tracker.begin(dataset).await?;
            info!(dataset = %dataset, run_id = %run_id, "Install run started");

            match work.await {
                Ok(report) if report.is_success() => {
                    self.tracker.succeed(dataset).await?;
                    info!(dataset = %dataset, run_id = %run_id, "Install run complete");
                    Ok(report)
                }
                Ok(report) => {
                    let message = [&report.places, &report.feature_codes]
                        .into_iter()
                        .flatten()
                        .filter(|s| !s.is_success())
                        .map(RefreshSummary::summary)
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.tracker.fail(dataset, &message).await?;
                    Ok(report)
                }
                Err(e) => {
                    error!(dataset = %dataset, run_id = %run_id, error = %e, "Install failed");
                    if let Err(status_err) = self.tracker.fail(dataset, &e.to_string()).await {
                        warn!(dataset = %dataset, error = %status_err, "Could not record failure");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    async fn locked<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(pool) = &self.lock_pool else {
            return work.await;
        };

        let mut conn = pool.acquire().await.map_err(RefreshError::Lock)?;
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(INSTALL_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .map_err(RefreshError::Lock)?;
        if !acquired {
            return Err(RefreshError::Locked(INSTALL_LOCK_KEY));
        }
        info!(key = INSTALL_LOCK_KEY, "Install lock acquired");

        let result = work.await;

        // Session locks outlive the checkout; release before the connection returns to the pool
        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(INSTALL_LOCK_KEY)
            .execute(&mut *conn)
            .await
        {
            warn!(error = %e, "Failed to release install lock; closing connection");
            if let Err(close_err) = conn.detach().close().await {
                warn!(error = %close_err, "Failed to close lock connection");
            }
        }

        result
    }
}
