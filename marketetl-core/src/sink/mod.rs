//! Durable destinations for normalized records.
//!
//! Every sink write is all-or-nothing: either the whole record set lands or
//! the call fails with a [`PersistenceError`] and the destination keeps its
//! prior contents. Nothing here retries.
//!
//! Writes happen in two steps so several sinks can succeed or fail together:
//! [`Sink::stage`] does all the fallible work without touching the
//! destination, and [`StagedWrite::commit`] publishes it. A committed file can
//! be reverted to its prior contents; a committed table cannot.

pub mod file;
pub mod table;

pub use file::{CsvMode, FileFormat, FileSink};
pub use table::{ConflictPolicy, TableSink};

use crate::data::schema::{NormalizedRecord, SchemaError};
use thiserror::Error;

/// What a successful write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub destination: String,
    pub rows_written: usize,
}

/// Structured errors for sink operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("table '{table}' already has a row for {timestamp}; batch rolled back")]
    Conflict { table: String, timestamp: String },

    #[error("invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("unsupported database URL '{0}' (expected postgres:// or sqlite:)")]
    UnsupportedDatabase(String),

    #[error("no records to write")]
    EmptyRecordSet,

    #[error("{0} cannot undo a committed write")]
    Irreversible(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// A destination the pipeline can persist to.
pub trait Sink {
    /// Human-readable destination, used in logs and receipts.
    fn describe(&self) -> String;

    /// Prepare the full record set without touching the destination.
    fn stage<'a>(
        &'a self,
        records: &'a [NormalizedRecord],
    ) -> Result<Box<dyn StagedWrite + 'a>, PersistenceError>;

    /// Stage and commit in one go.
    fn persist(&self, records: &[NormalizedRecord]) -> Result<WriteReceipt, PersistenceError> {
        self.stage(records)?.commit()
    }
}

/// A prepared write. Dropping it without committing discards the staged data.
pub trait StagedWrite {
    /// Publish the staged records at the destination.
    fn commit(&mut self) -> Result<WriteReceipt, PersistenceError>;

    /// Whether [`revert`](Self::revert) can undo a successful commit.
    fn reversible(&self) -> bool;

    /// Restore the destination to what it held before [`commit`](Self::commit).
    fn revert(&mut self) -> Result<(), PersistenceError>;
}
