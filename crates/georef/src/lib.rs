//! georef - reference table refresh
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Keeps large reference tables queryable while they are replaced from
//! periodically published flat-file extracts.
//!
//! # Overview
//!
//! - **Places**: partitions are discovered, merged into one master extract,
//!   bulk loaded into a staging twin of the live table and swapped in atomically
//!   ([`refresh::places::PlacesRefresh`])
//! - **Lookups**: small tables such as feature codes are validated line by line
//!   and inserted as one all-or-nothing batch ([`refresh::lookup::LookupPipeline`])
//! - **Status**: a coarse per-dataset lifecycle ([`refresh::status`])
//! - **Install**: both refreshes in order under an advisory lock ([`install::Installer`])
//!
//! Storage goes through the [`store::TableStore`] trait; [`store::PgTableStore`]
//! implements it for Postgres.
//!
//! # Testing
//!
//! The in-process stores used by `tests/refresh_pipeline_tests.rs` are behind
//! the `test-utils` feature, so run `cargo test -p georef --features test-utils`.
//! `tests/postgres_swap_tests.rs` is ignored unless run with `--ignored`
//! against a database named by `DATABASE_URL`.

pub mod config;
pub mod db;
pub mod error;
pub mod install;
pub mod refresh;
pub mod store;

pub use config::RefreshConfig;
pub use error::{RefreshError, Result, StoreError};
pub use install::{InstallReport, Installer};
pub use refresh::{RefreshSummary, RefreshState};
pub use store::{PgTableStore, TablePair, TableStore};
