//! Places refresh: discovery, master extract, bulk load and swap

use std::sync::Arc;
use tracing::{info, instrument};

use super::bulk_swap::BulkLoadSwap;
use super::discovery::{discover, PartitionPattern};
use super::master_extract::MasterExtractBuilder;
use super::{ProgressCallback, RefreshSummary};
use crate::config::RefreshConfig;
use crate::error::Result;
use crate::store::{ColumnMapping, StampedColumn, TableStore};

/// Columns of the extract, in file order
pub const PLACE_COLUMNS: [&str; 19] = [
    "geoname_id",
    "name",
    "ascii_name",
    "alternate_names",
    "latitude",
    "longitude",
    "feature_class",
    "feature_code",
    "country_code",
    "cc2",
    "admin1_code",
    "admin2_code",
    "admin3_code",
    "admin4_code",
    "population",
    "elevation",
    "dem",
    "timezone",
    "modification_date",
];

/// Extract fields plus the two bookkeeping columns stamped at load time
pub fn places_column_mapping() -> ColumnMapping {
    ColumnMapping::new(
        &PLACE_COLUMNS,
        vec![
            StampedColumn::LoadTime("created_at".to_string()),
            StampedColumn::Null("updated_at".to_string()),
        ],
    )
}

/// Refreshes the places table from the partitions in the storage directory
pub struct PlacesRefresh {
    store: Arc<dyn TableStore>,
    config: RefreshConfig,
}

impl PlacesRefresh {
    pub fn new(store: Arc<dyn TableStore>, config: RefreshConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip(self, progress), fields(dir = %self.config.partitions.storage_dir.display()))]
    pub async fn run(&self, progress: Option<&ProgressCallback>) -> Result<RefreshSummary> {
        let partitions_config = &self.config.partitions;
        let pattern = PartitionPattern::from(partitions_config);

        let partitions = discover(&partitions_config.storage_dir, &pattern).await?;
        let master = MasterExtractBuilder::new(partitions_config.master_path())
            .build(&partitions, progress)
            .await?;

        info!(
            master = %master.path.display(),
            lines = ?master.line_count,
            bytes = master.byte_count,
            "Master extract ready"
        );

        let mut swap = BulkLoadSwap::new(
            self.store.clone(),
            self.config.tables.places_pair(),
            places_column_mapping(),
            self.config.bulk_load_timeout(),
        );
        swap.run(&master.path, master.line_count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_shape() {
        let mapping = places_column_mapping();
        assert_eq!(mapping.input_width(), 19);
        let columns = mapping.columns();
        assert_eq!(columns.len(), 21);
        assert_eq!(columns[20], "updated_at");
    }
}
