//! Refresh lifecycle tracking
//!
//! Each dataset carries one coarse state that an orchestrator updates around
//! a refresh:
//!
//! ```text
//! NotInstalled ──begin──▶ Installing ──success──▶ Live
//!       ▲                     │
//!       │                     └──failure──▶ Error
//!       └── (any state) ──begin──▶ Installing
//! ```
//!
//! [`RefreshStatusRecord`] owns the transition rules. A [`StatusStore`]
//! persists records; [`RefreshStatusTracker`] combines the two and holds no
//! orchestration logic of its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{RefreshError, Result, StateError, StoreError};
use crate::store::validate_identifier;

/// Coarse lifecycle state of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    NotInstalled,
    Installing,
    Live,
    Error,
}

impl std::fmt::Display for RefreshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshState::NotInstalled => write!(f, "not_installed"),
            RefreshState::Installing => write!(f, "installing"),
            RefreshState::Live => write!(f, "live"),
            RefreshState::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for RefreshState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_installed" => Ok(RefreshState::NotInstalled),
            "installing" => Ok(RefreshState::Installing),
            "live" => Ok(RefreshState::Live),
            "error" => Ok(RefreshState::Error),
            _ => Err(anyhow::anyhow!("Invalid refresh state: {}", s)),
        }
    }
}

/// Lifecycle record of one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStatusRecord {
    pub dataset: String,
    pub state: RefreshState,
    pub first_installed_at: Option<DateTime<Utc>>,
    pub last_installed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RefreshStatusRecord {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            state: RefreshState::NotInstalled,
            first_installed_at: None,
            last_installed_at: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Start a run; allowed from every state so an interrupted run can be retried
    pub fn begin(&mut self, at: DateTime<Utc>) {
        self.state = RefreshState::Installing;
        self.last_error = None;
        self.updated_at = at;
    }

    pub fn mark_live(&mut self, at: DateTime<Utc>) -> std::result::Result<(), StateError> {
        self.require_installing("mark live")?;
        self.state = RefreshState::Live;
        self.first_installed_at.get_or_insert(at);
        self.last_installed_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    pub fn mark_error(
        &mut self,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StateError> {
        self.require_installing("mark failed")?;
        self.state = RefreshState::Error;
        self.last_error = Some(message.into());
        self.updated_at = at;
        Ok(())
    }

    fn require_installing(&self, action: &'static str) -> std::result::Result<(), StateError> {
        if self.state == RefreshState::Installing {
            Ok(())
        } else {
            Err(StateError {
                dataset: self.dataset.clone(),
                from: self.state,
                action,
            })
        }
    }
}

/// Persistence for lifecycle records
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self, dataset: &str) -> std::result::Result<Option<RefreshStatusRecord>, StoreError>;

    async fn save(&self, record: &RefreshStatusRecord) -> std::result::Result<(), StoreError>;

    async fn list(&self) -> std::result::Result<Vec<RefreshStatusRecord>, StoreError>;
}

/// Reads and advances lifecycle records through a [`StatusStore`]
#[derive(Clone)]
pub struct RefreshStatusTracker {
    store: Arc<dyn StatusStore>,
}

impl RefreshStatusTracker {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Current record, or a fresh `NotInstalled` one if the dataset was never seen
    pub async fn current(&self, dataset: &str) -> Result<RefreshStatusRecord> {
        Ok(self
            .store
            .load(dataset)
            .await
            .map_err(RefreshError::Status)?
            .unwrap_or_else(|| RefreshStatusRecord::new(dataset)))
    }

    pub async fn all(&self) -> Result<Vec<RefreshStatusRecord>> {
        self.store.list().await.map_err(RefreshError::Status)
    }

    pub async fn begin(&self, dataset: &str) -> Result<RefreshStatusRecord> {
        let mut record = self.current(dataset).await?;
        let from = record.state;
        record.begin(Utc::now());
        self.persist(&record).await?;
        info!(dataset = %dataset, from = %from, "Refresh started");
        Ok(record)
    }

    pub async fn succeed(&self, dataset: &str) -> Result<RefreshStatusRecord> {
        let mut record = self.current(dataset).await?;
        record.mark_live(Utc::now())?;
        self.persist(&record).await?;
        info!(dataset = %dataset, "Dataset is live");
        Ok(record)
    }

    pub async fn fail(&self, dataset: &str, message: &str) -> Result<RefreshStatusRecord> {
        let mut record = self.current(dataset).await?;
        record.mark_error(message, Utc::now())?;
        self.persist(&record).await?;
        info!(dataset = %dataset, error = %message, "Dataset refresh recorded as failed");
        Ok(record)
    }

    async fn persist(&self, record: &RefreshStatusRecord) -> Result<()> {
        self.store.save(record).await.map_err(RefreshError::Status)
    }
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    dataset: String,
    state: String,
    first_installed_at: Option<DateTime<Utc>>,
    last_installed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for RefreshStatusRecord {
    type Error = StoreError;

    fn try_from(row: StatusRow) -> std::result::Result<Self, Self::Error> {
        let state = row.state.parse().map_err(|e: anyhow::Error| {
            StoreError::Database(sqlx::Error::Decode(e.into()))
        })?;
        Ok(Self {
            dataset: row.dataset,
            state,
            first_installed_at: row.first_installed_at,
            last_installed_at: row.last_installed_at,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

/// Status records in a Postgres table, one row per dataset
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
    table: String,
}

impl PgStatusStore {
    /// Connect to `table`, creating it if missing
    pub async fn connect(pool: PgPool, table: &str) -> std::result::Result<Self, StoreError> {
        validate_identifier(table).map_err(StoreError::InvalidIdentifier)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                dataset TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                first_installed_at TIMESTAMPTZ,
                last_installed_at TIMESTAMPTZ,
                last_error TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table
        ))
        .execute(&pool)
        .await?;

        debug!(table = %table, "Status table ready");

        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn load(&self, dataset: &str) -> std::result::Result<Option<RefreshStatusRecord>, StoreError> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            r#"
            SELECT dataset, state, first_installed_at, last_installed_at, last_error, updated_at
            FROM "{}"
            WHERE dataset = $1
            "#,
            self.table
        ))
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RefreshStatusRecord::try_from).transpose()
    }

    async fn save(&self, record: &RefreshStatusRecord) -> std::result::Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO "{}" (dataset, state, first_installed_at, last_installed_at, last_error, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (dataset) DO UPDATE SET
                state = EXCLUDED.state,
                first_installed_at = EXCLUDED.first_installed_at,
                last_installed_at = EXCLUDED.last_installed_at,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
            self.table
        ))
        .bind(&record.dataset)
        .bind(record.state.to_string())
        .bind(record.first_installed_at)
        .bind(record.last_installed_at)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> std::result::Result<Vec<RefreshStatusRecord>, StoreError> {
        let rows = sqlx::query_as::<_, StatusRow>(&format!(
            r#"
            SELECT dataset, state, first_installed_at, last_installed_at, last_error, updated_at
            FROM "{}"
            ORDER BY dataset
            "#,
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RefreshStatusRecord::try_from).collect()
    }
}

/// Status records held in memory
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: tokio::sync::Mutex<std::collections::BTreeMap<String, RefreshStatusRecord>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self, dataset: &str) -> std::result::Result<Option<RefreshStatusRecord>, StoreError> {
        Ok(self.records.lock().await.get(dataset).cloned())
    }

    async fn save(&self, record: &RefreshStatusRecord) -> std::result::Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(record.dataset.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> std::result::Result<Vec<RefreshStatusRecord>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
