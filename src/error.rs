//! Error taxonomy for inference, table creation, and transfers.
//!
//! Row-level problems never surface here; they are counted as [`RowParseError`]
//! values by the transfer's error accumulator and the transfer carries on.

use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Failure reported by a single warehouse attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WarehouseError {
    /// Transport or authentication failure while opening or using a connection.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The warehouse accepted the connection but rejected the statement.
    #[error("operation failed: {0}")]
    Operation(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unsupported file format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("source {} is empty: {reason}", path.display())]
    EmptySource { path: PathBuf, reason: String },

    #[error("source {} is not readable: {reason}", path.display())]
    InvalidSource { path: PathBuf, reason: String },

    #[error("invalid table name '{0}'")]
    InvalidTable(String),

    #[error("connection failed after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    #[error("warehouse operation failed after {attempts} attempt(s): {source}")]
    Operation {
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    #[error("creating table '{table}' failed after {attempts} attempt(s): {source}")]
    TableCreation {
        table: String,
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    /// A batch failed on every attempt. Rows from earlier batches stay in the table.
    #[error(
        "inserting batch {batch} into '{table}' failed after {attempts} attempt(s) \
         ({rows_committed} row(s) already committed, {row_errors} malformed row(s) skipped): {source}"
    )]
    BatchInsert {
        table: String,
        batch: usize,
        attempts: u32,
        rows_committed: usize,
        row_errors: usize,
        #[source]
        source: WarehouseError,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransferError {
    /// Rows already written to the warehouse when the transfer stopped.
    pub fn rows_committed(&self) -> usize {
        match self {
            TransferError::BatchInsert { rows_committed, .. } => *rows_committed,
            _ => 0,
        }
    }

    /// Malformed rows skipped before the transfer stopped.
    pub fn row_errors(&self) -> usize {
        match self {
            TransferError::BatchInsert { row_errors, .. } => *row_errors,
            _ => 0,
        }
    }
}

/// A single source row that could not be serialized. Recoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowParseError {
    /// 1-based position of the row in the source (the header is row 1 for CSV).
    pub row: usize,
    pub message: String,
}

impl fmt::Display for RowParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.row, self.message)
    }
}

impl std::error::Error for RowParseError {}
