//! Error types for refresh runs
//!
//! [`RefreshError`] is the run-level error. Any variant aborts the refresh of
//! the table it concerns and leaves the live table as it was. Per-row
//! [`ValidationError`]s are not part of it: they are counted and logged, and
//! the run continues.
//!
//! [`StoreError`] is what the storage collaborator reports. The pipelines wrap
//! it with the step it happened in.

use std::path::PathBuf;
use thiserror::Error;

use crate::refresh::status::RefreshState;

/// Result type alias for refresh operations
pub type Result<T> = std::result::Result<T, RefreshError>;

/// Run-level refresh failure
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Cannot read storage directory {path}: {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to merge partition {partition}: {source}")]
    Merge {
        partition: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No relevant partitions found in {0}")]
    NoPartitions(PathBuf),

    #[error("Preparing staging table '{table}' failed: {source}")]
    Staging {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Bulk load into '{table}' failed: {source}")]
    Load {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Master extract {path} loaded no rows into '{table}'; live table kept")]
    EmptyExtract { path: PathBuf, table: String },

    #[error("Inserting lookup rows into '{table}' failed: {source}")]
    Insert {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("Promoting '{staging}' over '{live}' failed: {source}")]
    Swap {
        live: String,
        staging: String,
        #[source]
        source: StoreError,
    },

    #[error("Cannot derive a language code from lookup file name '{0}'")]
    Provenance(String),

    #[error("Cannot read lookup file {path}: {source}")]
    LookupFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} on '{table}' did not finish within {secs}s")]
    Timeout {
        operation: &'static str,
        table: String,
        secs: u64,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Status store error: {0}")]
    Status(#[source] StoreError),

    #[error("Another refresh is already running (install lock {0} is held)")]
    Locked(i64),

    #[error("Install lock query failed: {0}")]
    Lock(#[source] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure reported by a storage collaborator
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected {expected} tab-delimited fields, found {found}")]
    MalformedLine {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Table '{0}' does not exist")]
    MissingTable(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Schema of '{staging}' differs from '{live}': {detail}")]
    SchemaMismatch {
        live: String,
        staging: String,
        detail: String,
    },

    #[error("Row {row} rejected by '{table}': {reason}")]
    RowRejected {
        table: String,
        row: usize,
        reason: String,
    },
}

/// Why a lookup line was dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("identifier '{0}' is not two non-empty dot-separated segments")]
    Identifier(String),
}

/// Lifecycle transition attempted from the wrong prior state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot {action} dataset '{dataset}' while it is {from}")]
pub struct StateError {
    pub dataset: String,
    pub from: RefreshState,
    pub action: &'static str,
}
