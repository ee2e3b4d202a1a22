//! Master extract builder
//!
//! Turns the discovered partitions into the single file the bulk load reads.
//! A consolidated partition is renamed into place. Otherwise every country
//! partition is appended, byte for byte, in discovery order.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};

use super::discovery::{PartitionKind, SourcePartition};
use super::ProgressCallback;
use crate::error::{RefreshError, Result};

/// Read size while merging
const MERGE_CHUNK_BYTES: usize = 1 << 20;

/// The file handed to the bulk load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterExtract {
    pub path: PathBuf,
    /// Lines written; `None` when a consolidated partition was renamed without reading it
    pub line_count: Option<u64>,
    pub byte_count: u64,
}

pub struct MasterExtractBuilder {
    master_path: PathBuf,
}

impl MasterExtractBuilder {
    pub fn new(master_path: impl Into<PathBuf>) -> Self {
        Self {
            master_path: master_path.into(),
        }
    }

    /// Build the master extract from `partitions`
    #[instrument(skip(self, partitions, progress), fields(master = %self.master_path.display()))]
    pub async fn build(
        &self,
        partitions: &[SourcePartition],
        progress: Option<&ProgressCallback>,
    ) -> Result<MasterExtract> {
        if partitions.is_empty() {
            let dir = self
                .master_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            return Err(RefreshError::NoPartitions(dir));
        }

        if let Some(consolidated) = partitions
            .iter()
            .find(|p| p.kind == PartitionKind::Consolidated)
        {
            return self.promote_consolidated(consolidated, progress).await;
        }

        self.merge(partitions, progress).await
    }

    async fn promote_consolidated(
        &self,
        partition: &SourcePartition,
        progress: Option<&ProgressCallback>,
    ) -> Result<MasterExtract> {
        tokio::fs::rename(&partition.path, &self.master_path)
            .await
            .map_err(|source| RefreshError::Merge {
                partition: partition.path.clone(),
                source,
            })?;

        if let Some(report) = progress {
            report(1.0, &format!("Using {} as master extract", partition.name));
        }

        info!(
            partition = %partition.name,
            bytes = partition.byte_size,
            "Consolidated partition renamed to master extract"
        );

        Ok(MasterExtract {
            path: self.master_path.clone(),
            line_count: None,
            byte_count: partition.byte_size,
        })
    }

    async fn merge(
        &self,
        partitions: &[SourcePartition],
        progress: Option<&ProgressCallback>,
    ) -> Result<MasterExtract> {
        let master_error = |source: std::io::Error| RefreshError::Merge {
            partition: self.master_path.clone(),
            source,
        };

        let file = tokio::fs::File::create(&self.master_path)
            .await
            .map_err(master_error)?;
        let mut writer = BufWriter::with_capacity(MERGE_CHUNK_BYTES, file);
        let mut buffer = vec![0u8; MERGE_CHUNK_BYTES];

        let mut total_lines = 0u64;
        let mut total_bytes = 0u64;

        for partition in partitions {
            let (lines, bytes) = append_partition(&mut writer, partition, &mut buffer, progress)
                .await
                .map_err(|source| RefreshError::Merge {
                    partition: partition.path.clone(),
                    source,
                })?;

            debug!(partition = %partition.name, lines, bytes, "Partition merged");
            total_lines += lines;
            total_bytes += bytes;
        }

        writer.flush().await.map_err(master_error)?;
        writer.into_inner().sync_all().await.map_err(master_error)?;

        info!(
            partitions = partitions.len(),
            lines = total_lines,
            bytes = total_bytes,
            "Master extract written"
        );

        Ok(MasterExtract {
            path: self.master_path.clone(),
            line_count: Some(total_lines),
            byte_count: total_bytes,
        })
    }
}

/// Copy one partition onto `writer`, returning (lines, bytes) written
///
/// A final line without a terminator gets one, so it cannot run into the
/// next partition's first line.
async fn append_partition(
    writer: &mut BufWriter<tokio::fs::File>,
    partition: &SourcePartition,
    buffer: &mut [u8],
    progress: Option<&ProgressCallback>,
) -> std::io::Result<(u64, u64)> {
    let mut reader = tokio::fs::File::open(&partition.path).await?;
    let message = format!("Merging {}", partition.name);

    let mut lines = 0u64;
    let mut bytes = 0u64;
    let mut last_byte = None;

    loop {
        let read = reader.read(buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        writer.write_all(chunk).await?;

        lines += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        bytes += read as u64;
        last_byte = chunk.last().copied();

        if let Some(report) = progress {
            let fraction = if partition.byte_size == 0 {
                1.0
            } else {
                (bytes as f64 / partition.byte_size as f64).min(1.0)
            };
            report(fraction, &message);
        }
    }

    if matches!(last_byte, Some(b) if b != b'\n') {
        writer.write_all(b"\n").await?;
        lines += 1;
        bytes += 1;
    }

    Ok((lines, bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn partition(dir: &Path, name: &str, content: &str, kind: PartitionKind) -> SourcePartition {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        SourcePartition {
            name: name.to_string(),
            path,
            kind,
            byte_size: content.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_merge_appends_in_order_and_counts_lines() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![
            partition(dir.path(), "FR.txt", "1\tParis\n2\tLyon\n", PartitionKind::CountryScoped),
            partition(dir.path(), "US.txt", "3\tBoston\n", PartitionKind::CountryScoped),
        ];

        let builder = MasterExtractBuilder::new(dir.path().join("master.txt"));
        let master = builder.build(&parts, None).await.unwrap();

        assert_eq!(master.line_count, Some(3));
        assert_eq!(
            std::fs::read_to_string(&master.path).unwrap(),
            "1\tParis\n2\tLyon\n3\tBoston\n"
        );
        assert!(parts[0].path.exists());
    }

    #[tokio::test]
    async fn test_merge_terminates_unterminated_partition() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![
            partition(dir.path(), "AD.txt", "1\tAndorra", PartitionKind::CountryScoped),
            partition(dir.path(), "AE.txt", "2\tDubai\n", PartitionKind::CountryScoped),
        ];

        let master = MasterExtractBuilder::new(dir.path().join("master.txt"))
            .build(&parts, None)
            .await
            .unwrap();

        assert_eq!(master.line_count, Some(2));
        assert_eq!(
            std::fs::read_to_string(&master.path).unwrap(),
            "1\tAndorra\n2\tDubai\n"
        );
    }

    #[tokio::test]
    async fn test_merge_truncates_previous_master() {
        let dir = tempfile::tempdir().unwrap();
        let master_path = dir.path().join("master.txt");
        std::fs::write(&master_path, "stale\nstale\nstale\n").unwrap();
        let parts = vec![partition(dir.path(), "US.txt", "3\tBoston\n", PartitionKind::CountryScoped)];

        let master = MasterExtractBuilder::new(&master_path)
            .build(&parts, None)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&master.path).unwrap(), "3\tBoston\n");
    }

    #[tokio::test]
    async fn test_missing_partition_names_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut part = partition(dir.path(), "US.txt", "x\n", PartitionKind::CountryScoped);
        part.path = dir.path().join("gone.txt");

        let err = MasterExtractBuilder::new(dir.path().join("master.txt"))
            .build(&[part], None)
            .await
            .unwrap_err();
        match err {
            RefreshError::Merge { partition, .. } => assert!(partition.ends_with("gone.txt")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_partition_list() {
        let dir = tempfile::tempdir().unwrap();
        let err = MasterExtractBuilder::new(dir.path().join("master.txt"))
            .build(&[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::NoPartitions(_)));
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let dir = tempfile::tempdir().unwrap();
        let parts = vec![partition(dir.path(), "US.txt", "3\tBoston\n", PartitionKind::CountryScoped)];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |fraction, message: &str| {
            sink.lock().unwrap().push((fraction, message.to_string()));
        });

        MasterExtractBuilder::new(dir.path().join("master.txt"))
            .build(&parts, Some(&callback))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let (fraction, message) = seen.last().unwrap();
        assert_eq!(*fraction, 1.0);
        assert_eq!(message, "Merging US.txt");
    }
}
