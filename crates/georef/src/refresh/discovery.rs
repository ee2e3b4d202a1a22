//! Partition discovery
//!
//! Decides which files in the storage directory are source partitions. Only
//! the directory itself is listed; subdirectories are never entered.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::PartitionConfig;
use crate::error::{RefreshError, Result};

/// What a partition covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// One country, named by its two-letter code
    CountryScoped,
    /// Every country in one file
    Consolidated,
}

/// One downloaded extract file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePartition {
    pub name: String,
    pub path: PathBuf,
    pub kind: PartitionKind,
    pub byte_size: u64,
}

/// File naming rules for partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPattern {
    pub consolidated_stem: String,
    pub extension: String,
}

impl PartitionPattern {
    pub fn new(consolidated_stem: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            consolidated_stem: consolidated_stem.into(),
            extension: extension.into(),
        }
    }

    /// Classify a bare file name; `None` means the file is not a partition
    pub fn classify(&self, name: &str) -> Option<PartitionKind> {
        let (stem, extension) = name.rsplit_once('.')?;
        if extension != self.extension {
            return None;
        }

        if stem == self.consolidated_stem {
            Some(PartitionKind::Consolidated)
        } else if stem.len() == 2 && stem.bytes().all(|b| b.is_ascii_uppercase()) {
            Some(PartitionKind::CountryScoped)
        } else {
            None
        }
    }
}

impl From<&PartitionConfig> for PartitionPattern {
    fn from(config: &PartitionConfig) -> Self {
        Self::new(&config.consolidated_stem, &config.extension)
    }
}

/// List the partitions in `dir`, sorted by name
pub async fn discover(dir: &Path, pattern: &PartitionPattern) -> Result<Vec<SourcePartition>> {
    let discovery_error = |source: std::io::Error| RefreshError::Discovery {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(discovery_error)?;
    let mut partitions = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(discovery_error)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(kind) = pattern.classify(&name) else {
            debug!(file = %name, "Ignoring non-partition file");
            continue;
        };

        let metadata = entry.metadata().await.map_err(discovery_error)?;
        if !metadata.is_file() {
            continue;
        }

        partitions.push(SourcePartition {
            name,
            path: entry.path(),
            kind,
            byte_size: metadata.len(),
        });
    }

    partitions.sort_by(|a, b| a.name.cmp(&b.name));

    info!(
        dir = %dir.display(),
        partitions = partitions.len(),
        consolidated = partitions.iter().any(|p| p.kind == PartitionKind::Consolidated),
        "Discovered partitions"
    );

    Ok(partitions)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn pattern() -> PartitionPattern {
        PartitionPattern::new("allCountries", "txt")
    }

    #[test]
    fn test_classify() {
        let pattern = pattern();
        assert_eq!(
            pattern.classify("allCountries.txt"),
            Some(PartitionKind::Consolidated)
        );
        assert_eq!(pattern.classify("US.txt"), Some(PartitionKind::CountryScoped));
        assert_eq!(pattern.classify("README.txt"), None);
        assert_eq!(pattern.classify("us.txt"), None);
        assert_eq!(pattern.classify("USA.txt"), None);
        assert_eq!(pattern.classify("US.zip"), None);
        assert_eq!(pattern.classify("allCountries_master.txt"), None);
        assert_eq!(pattern.classify("US"), None);
    }

    #[test]
    fn test_classify_archives() {
        let pattern = PartitionPattern::new("allCountries", "zip");
        assert_eq!(pattern.classify("FR.zip"), Some(PartitionKind::CountryScoped));
        assert_eq!(
            pattern.classify("allCountries.zip"),
            Some(PartitionKind::Consolidated)
        );
    }

    #[tokio::test]
    async fn test_discover_skips_noise_and_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("US.txt"), "a\n").unwrap();
        std::fs::write(dir.path().join("FR.txt"), "bb\n").unwrap();
        std::fs::write(dir.path().join("README.txt"), "noise").unwrap();
        std::fs::create_dir(dir.path().join("DE.txt")).unwrap();

        let found = discover(dir.path(), &pattern()).await.unwrap();
        let names: Vec<_> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["FR.txt", "US.txt"]);
        assert_eq!(found[0].byte_size, 3);
    }

    #[tokio::test]
    async fn test_discover_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&dir.path().join("absent"), &pattern())
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Discovery { .. }));
    }
}
