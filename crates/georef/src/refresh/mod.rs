//! Reference table refresh pipelines
//!
//! Two paths lead to a refreshed table:
//!
//! - Places: [`discovery`] finds the partitions, [`master_extract`] merges
//!   them, and [`bulk_swap`] loads the result into staging and promotes it.
//!   [`places`] wires the three together.
//! - Lookups: [`lookup`] parses, validates and inserts small files such as
//!   [`feature_codes`] as one batch, then promotes staging the same way.
//!
//! [`status`] records each dataset's lifecycle around either path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod bulk_swap;
pub mod discovery;
pub mod feature_codes;
pub mod lookup;
pub mod master_extract;
pub mod places;
pub mod status;

pub use bulk_swap::{promote, BulkLoadSwap, LoadState};
pub use discovery::{discover, PartitionKind, PartitionPattern, SourcePartition};
pub use feature_codes::{FeatureCode, FeatureCodeSchema};
pub use lookup::{language_code, LookupPipeline, LookupSchema};
pub use master_extract::{MasterExtract, MasterExtractBuilder};
pub use places::{places_column_mapping, PlacesRefresh};
pub use status::{RefreshState, RefreshStatusRecord, RefreshStatusTracker, StatusStore};

/// Progress callback: fraction done in `0.0..=1.0` and a short message
///
/// Purely informational; nothing in a refresh depends on it.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Outcome of refreshing one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub table: String,
    /// Records presented to the table: extract lines for a bulk load, non-blank lines for a lookup
    pub attempted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub elapsed: Duration,
    pub success: bool,
}

impl RefreshSummary {
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn summary(&self) -> String {
        if self.success {
            format!(
                "Refreshed {}: {} of {} records accepted, {} rejected in {:.1}s",
                self.table,
                self.accepted,
                self.attempted,
                self.rejected,
                self.elapsed.as_secs_f64()
            )
        } else {
            format!(
                "Refresh of {} failed: {} of {} records accepted, {} rejected in {:.1}s",
                self.table,
                self.accepted,
                self.attempted,
                self.rejected,
                self.elapsed.as_secs_f64()
            )
        }
    }
}
