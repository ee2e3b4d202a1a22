//! Configuration management
//!
//! Settings come from the environment (after loading `.env`), falling back to
//! the constants below. Table names end up inside DDL statements, so they are
//! checked against [`crate::store::validate_identifier`] before use.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::DbConfig;
use crate::error::{RefreshError, Result};
use crate::refresh::discovery::PartitionPattern;
use crate::store::{validate_identifier, TablePair};

// ============================================================================
// Refresh Configuration Constants
// ============================================================================

/// Directory holding the extracted partition files.
pub const DEFAULT_STORAGE_DIR: &str = "./data/geonames";

/// Name of the merged master extract written into the storage directory.
pub const DEFAULT_MASTER_FILE: &str = "allCountries_master.txt";

/// File stem of the consolidated all-countries partition.
pub const DEFAULT_CONSOLIDATED_STEM: &str = "allCountries";

/// Extension of the extracted (text) partitions.
pub const DEFAULT_PARTITION_EXTENSION: &str = "txt";

/// Live places table.
pub const DEFAULT_PLACES_TABLE: &str = "geonames_place";

/// Live feature code lookup table.
pub const DEFAULT_FEATURE_CODE_TABLE: &str = "geonames_feature_code";

/// Suffix appended to a live table name to form its staging twin.
pub const DEFAULT_STAGING_SUFFIX: &str = "_staging";

/// Table holding one lifecycle row per dataset.
pub const DEFAULT_STATUS_TABLE: &str = "georef_refresh_status";

/// Upper bound for the bulk load of the master extract (4 hours).
pub const DEFAULT_BULK_LOAD_TIMEOUT_SECS: u64 = 4 * 60 * 60;

/// Upper bound for one lookup table's batch insert (10 minutes).
pub const DEFAULT_INSERT_TIMEOUT_SECS: u64 = 600;

/// Complete refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub database: DbConfig,
    pub partitions: PartitionConfig,
    pub tables: TableConfig,
    pub bulk_load_timeout_secs: u64,
    pub insert_timeout_secs: u64,
}

/// Where partitions live and how they are named
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub storage_dir: PathBuf,
    pub master_file: String,
    pub consolidated_stem: String,
    pub extension: String,
}

/// Names of the tables a refresh touches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub places: String,
    pub feature_codes: String,
    pub staging_suffix: String,
    pub status: String,
}

impl PartitionConfig {
    /// Absolute-or-relative path of the master extract
    pub fn master_path(&self) -> PathBuf {
        self.storage_dir.join(&self.master_file)
    }
}

impl TableConfig {
    pub fn places_pair(&self) -> TablePair {
        TablePair::with_suffix(&self.places, &self.staging_suffix)
    }

    pub fn feature_code_pair(&self) -> TablePair {
        TablePair::with_suffix(&self.feature_codes, &self.staging_suffix)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl RefreshConfig {
    /// Load configuration from `.env`, the environment, and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = RefreshConfig {
            database: DbConfig::from_env().map_err(|e| RefreshError::Config(e.to_string()))?,
            partitions: PartitionConfig {
                storage_dir: PathBuf::from(env_or("GEOREF_STORAGE_DIR", DEFAULT_STORAGE_DIR)),
                master_file: env_or("GEOREF_MASTER_FILE", DEFAULT_MASTER_FILE),
                consolidated_stem: env_or("GEOREF_CONSOLIDATED_STEM", DEFAULT_CONSOLIDATED_STEM),
                extension: env_or("GEOREF_PARTITION_EXTENSION", DEFAULT_PARTITION_EXTENSION),
            },
            tables: TableConfig {
                places: env_or("GEOREF_PLACES_TABLE", DEFAULT_PLACES_TABLE),
                feature_codes: env_or("GEOREF_FEATURE_CODE_TABLE", DEFAULT_FEATURE_CODE_TABLE),
                staging_suffix: env_or("GEOREF_STAGING_SUFFIX", DEFAULT_STAGING_SUFFIX),
                status: env_or("GEOREF_STATUS_TABLE", DEFAULT_STATUS_TABLE),
            },
            bulk_load_timeout_secs: env_parse_or(
                "GEOREF_BULK_LOAD_TIMEOUT_SECS",
                DEFAULT_BULK_LOAD_TIMEOUT_SECS,
            ),
            insert_timeout_secs: env_parse_or(
                "GEOREF_INSERT_TIMEOUT_SECS",
                DEFAULT_INSERT_TIMEOUT_SECS,
            ),
        };

        config.validate()?;

        Ok(config)
    }

    /// Set the partition directory
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.partitions.storage_dir = dir.into();
        self
    }

    /// Set the places table name
    pub fn with_places_table(mut self, table: impl Into<String>) -> Self {
        self.tables.places = table.into();
        self
    }

    /// Set the bulk load timeout
    pub fn with_bulk_load_timeout(mut self, timeout_secs: u64) -> Self {
        self.bulk_load_timeout_secs = timeout_secs;
        self
    }

    pub fn bulk_load_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_load_timeout_secs)
    }

    pub fn insert_timeout(&self) -> Duration {
        Duration::from_secs(self.insert_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tables.staging_suffix.is_empty() {
            return Err(RefreshError::Config(
                "Staging suffix cannot be empty: staging would alias the live table".to_string(),
            ));
        }

        validate_identifier(&self.tables.status).map_err(RefreshError::Config)?;
        // Every name a swap touches must be usable before hours of loading
        for pair in [self.tables.places_pair(), self.tables.feature_code_pair()] {
            for name in [&pair.live, &pair.staging, &pair.retired()] {
                validate_identifier(name).map_err(RefreshError::Config)?;
            }
        }

        if self.partitions.master_file.is_empty() || self.partitions.extension.is_empty() {
            return Err(RefreshError::Config(
                "Master file name and partition extension cannot be empty".to_string(),
            ));
        }

        if PartitionPattern::from(&self.partitions)
            .classify(&self.partitions.master_file)
            .is_some()
        {
            return Err(RefreshError::Config(format!(
                "Master file '{}' would be discovered as a partition and overwritten",
                self.partitions.master_file
            )));
        }

        if self.bulk_load_timeout_secs == 0 || self.insert_timeout_secs == 0 {
            return Err(RefreshError::Config("Timeouts must be greater than 0".to_string()));
        }

        self.database
            .validate()
            .map_err(|e| RefreshError::Config(e.to_string()))?;

        Ok(())
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            partitions: PartitionConfig {
                storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
                master_file: DEFAULT_MASTER_FILE.to_string(),
                consolidated_stem: DEFAULT_CONSOLIDATED_STEM.to_string(),
                extension: DEFAULT_PARTITION_EXTENSION.to_string(),
            },
            tables: TableConfig {
                places: DEFAULT_PLACES_TABLE.to_string(),
                feature_codes: DEFAULT_FEATURE_CODE_TABLE.to_string(),
                staging_suffix: DEFAULT_STAGING_SUFFIX.to_string(),
                status: DEFAULT_STATUS_TABLE.to_string(),
            },
            bulk_load_timeout_secs: DEFAULT_BULK_LOAD_TIMEOUT_SECS,
            insert_timeout_secs: DEFAULT_INSERT_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = RefreshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.partitions.master_path(),
            PathBuf::from("./data/geonames/allCountries_master.txt")
        );
        assert_eq!(config.tables.places_pair().staging, "geonames_place_staging");
    }

    #[test]
    fn test_rejects_empty_staging_suffix() {
        let mut config = RefreshConfig::default();
        config.tables.staging_suffix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let config = RefreshConfig::default().with_places_table("places; DROP TABLE users");
        assert!(matches!(config.validate(), Err(RefreshError::Config(_))));
    }

    #[test]
    fn test_rejects_overlong_retired_name() {
        let live = "p".repeat(56);
        let mut config = RefreshConfig::default().with_places_table(&live);
        config.tables.staging_suffix = "_s".to_string();
        assert!(validate_identifier(&config.tables.places_pair().staging).is_ok());

        let err = config.validate().unwrap_err();
        assert!(matches!(err, RefreshError::Config(ref msg) if msg.contains("_retired")));
    }

    #[test]
    fn test_rejects_master_file_named_like_a_partition() {
        let mut config = RefreshConfig::default();
        config.partitions.master_file = "US.txt".to_string();
        assert!(matches!(config.validate(), Err(RefreshError::Config(_))));

        config.partitions.master_file = "allCountries.txt".to_string();
        assert!(matches!(config.validate(), Err(RefreshError::Config(_))));
    }

    #[test]
    fn test_builder_pattern() {
        let config = RefreshConfig::default()
            .with_storage_dir("/srv/geonames")
            .with_places_table("places")
            .with_bulk_load_timeout(60);

        assert_eq!(config.partitions.storage_dir, PathBuf::from("/srv/geonames"));
        assert_eq!(config.tables.places, "places");
        assert_eq!(config.bulk_load_timeout(), Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/georef_test");
        std::env::set_var("GEOREF_PLACES_TABLE", "places");
        std::env::set_var("GEOREF_INSERT_TIMEOUT_SECS", "30");

        let config = RefreshConfig::load().unwrap();
        assert_eq!(config.tables.places, "places");
        assert_eq!(config.insert_timeout_secs, 30);
        assert!(config.database.url.contains("georef_test"));

        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("GEOREF_PLACES_TABLE");
        std::env::remove_var("GEOREF_INSERT_TIMEOUT_SECS");
    }
}
