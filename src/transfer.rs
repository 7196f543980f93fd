//! Batched ingestion into, and export out of, warehouse tables.
//!
//! Ingestion streams a [`RowSource`] in order, groups serialized rows into
//! batches of [`TransferConfig::batch_size`], and submits one batch at a time
//! through the [`ConnectionGateway`]. Malformed rows are counted and skipped; a
//! batch that fails on every attempt ends the transfer. Earlier batches stay
//! committed.

use std::{io::Write, path::Path};

use log::{debug, error, info};
use serde::Serialize;
use serde_json::Value;

use crate::{
    ddl::{TableDdl, build_ddl, quote_identifier, quote_table},
    error::{RowParseError, TransferError, WarehouseError},
    gateway::{Connection, ConnectionGateway, Connector},
    io_utils,
    retry::{CancelToken, RetryError, RetryPolicy},
    schema::{Schema, infer_schema},
    source::{RowOutcome, RowSource, SourceKind, open_source},
};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransferConfig {
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Result<Self, String> {
        if batch_size == 0 {
            return Err("batch size must be at least 1".to_string());
        }
        Ok(Self { batch_size, retry })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub status: TransferStatus,
    pub rows_written: usize,
    pub row_errors: usize,
    /// Number of successful flushes.
    pub batches: usize,
    /// Failed attempts that a later attempt recovered from.
    pub batch_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub status: TransferStatus,
    pub rows_exported: usize,
}

/// Caller-facing summary: `{"status": ..., "count": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultPayload {
    pub status: TransferStatus,
    pub count: usize,
}

impl ResultPayload {
    pub fn from_ingest(result: &Result<TransferResult, TransferError>) -> Self {
        match result {
            Ok(done) => Self {
                status: done.status,
                count: done.rows_written,
            },
            Err(err) => Self::failed(err),
        }
    }

    pub fn from_export(result: &Result<ExportResult, TransferError>) -> Self {
        match result {
            Ok(done) => Self {
                status: done.status,
                count: done.rows_exported,
            },
            Err(err) => Self::failed(err),
        }
    }

    fn failed(err: &TransferError) -> Self {
        let status = match err {
            TransferError::Cancelled => TransferStatus::Cancelled,
            _ => TransferStatus::Failed,
        };
        Self {
            status,
            count: err.rows_committed(),
        }
    }
}

/// Per-transfer row and batch failure bookkeeping.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    rows_written: usize,
    row_errors: usize,
    batches: usize,
    batch_retries: u32,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_row_error(&mut self, err: &RowParseError) {
        self.row_errors += 1;
        error!("Skipping malformed row {}: {}", err.row, err.message);
    }

    pub fn record_flush(&mut self, rows: usize, attempts: u32) {
        self.rows_written += rows;
        self.batches += 1;
        self.batch_retries += attempts.saturating_sub(1);
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn row_errors(&self) -> usize {
        self.row_errors
    }

    pub fn finish(self, status: TransferStatus) -> TransferResult {
        TransferResult {
            status,
            rows_written: self.rows_written,
            row_errors: self.row_errors,
            batches: self.batches,
            batch_retries: self.batch_retries,
        }
    }
}

#[derive(Debug)]
struct Batch {
    rows: Vec<String>,
    capacity: usize,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity.min(DEFAULT_BATCH_SIZE)),
            capacity,
        }
    }

    fn push(&mut self, row: String) {
        self.rows.push(row);
    }

    fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    /// Rows joined into one bulk-load body, each terminated by `\n`.
    fn payload(&self) -> String {
        let size = self.rows.iter().map(|r| r.len() + 1).sum();
        let mut body = String::with_capacity(size);
        for row in &self.rows {
            body.push_str(row);
            body.push('\n');
        }
        body
    }

    fn clear(&mut self) {
        self.rows.clear();
    }
}

pub struct BatchTransferEngine<C> {
    gateway: ConnectionGateway<C>,
    config: TransferConfig,
}

impl<C: Connector> BatchTransferEngine<C> {
    pub fn new(connector: C, config: TransferConfig) -> Self {
        Self {
            gateway: ConnectionGateway::new(connector, config.retry),
            config,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.gateway = self.gateway.with_cancel_token(cancel);
        self
    }

    /// Drops and recreates `table` for `schema`.
    pub fn create_table(&self, schema: &Schema, table: &str) -> Result<TableDdl, TransferError> {
        let ddl = build_ddl(schema, table)?;
        info!("Creating table {table} ordered by {}", ddl.order_by);
        let label = format!("create table {table}");
        self.gateway
            .with_retry(&label, |conn| {
                for statement in ddl.statements() {
                    conn.execute(statement)?;
                }
                Ok(())
            })
            .map_err(|err| match err {
                RetryError::Cancelled => TransferError::Cancelled,
                RetryError::Exhausted { attempts, last } => TransferError::TableCreation {
                    table: table.to_string(),
                    attempts,
                    source: last,
                },
            })?;
        info!("Table {table} created");
        Ok(ddl)
    }

    /// Infers (unless `schema` is given), recreates the table, and loads `path`.
    pub fn ingest_file(
        &self,
        path: &Path,
        kind: Option<SourceKind>,
        table: &str,
        schema: Option<Schema>,
    ) -> Result<TransferResult, TransferError> {
        let kind = SourceKind::resolve(path, kind)?;
        let mut source = open_source(path, kind)?;
        let schema = match schema {
            Some(schema) => schema,
            None => {
                info!("Inferring schema for {path:?}");
                infer_schema(source.as_ref())?
            }
        };
        check_width(source.as_ref(), &schema)?;
        self.create_table(&schema, table)?;
        self.load(source.as_mut(), &schema, table)
    }

    /// Loads every row of `source` into an existing `table`.
    pub fn ingest<S>(
        &self,
        source: &mut S,
        schema: &Schema,
        table: &str,
    ) -> Result<TransferResult, TransferError>
    where
        S: RowSource + ?Sized,
    {
        check_width(&*source, schema)?;
        self.load(source, schema, table)
    }

    fn load<S>(
        &self,
        source: &mut S,
        schema: &Schema,
        table: &str,
    ) -> Result<TransferResult, TransferError>
    where
        S: RowSource + ?Sized,
    {
        let kind = source.kind();
        let statement = format!(
            "INSERT INTO {} FORMAT {}",
            quote_table(table)?,
            kind.insert_format()
        );
        info!("Loading {:?} data from {:?} into {table}", kind, source.origin());

        let mut errors = ErrorAccumulator::new();
        let mut batch = Batch::new(self.config.batch_size);
        while let Some(outcome) = source.next_row(schema)? {
            match outcome {
                RowOutcome::Serialized(row) => batch.push(row),
                RowOutcome::Malformed(err) => {
                    errors.record_row_error(&err);
                    continue;
                }
            }
            if batch.is_full() {
                self.flush(table, &statement, &batch, &mut errors)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.flush(table, &statement, &batch, &mut errors)?;
        }

        info!(
            "Loaded {} row(s) into {table} with {} error(s)",
            errors.rows_written(),
            errors.row_errors()
        );
        Ok(errors.finish(TransferStatus::Completed))
    }

    fn flush(
        &self,
        table: &str,
        statement: &str,
        batch: &Batch,
        errors: &mut ErrorAccumulator,
    ) -> Result<(), TransferError> {
        if self.gateway.cancel_token().is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let number = errors.batches + 1;
        let payload = batch.payload();
        let label = format!("insert batch {number} into {table}");
        debug!("Flushing batch {number} of {} row(s)", batch.len());
        match self
            .gateway
            .with_retry(&label, |conn| conn.insert(statement, &payload))
        {
            Ok(attempted) => {
                errors.record_flush(batch.len(), attempted.attempts);
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(TransferError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(TransferError::BatchInsert {
                table: table.to_string(),
                batch: number,
                attempts,
                rows_committed: errors.rows_written(),
                row_errors: errors.row_errors(),
                source: last,
            }),
        }
    }

    /// Reads `columns` (all when empty) from `table` into `destination`.
    pub fn export(
        &self,
        table: &str,
        columns: &[String],
        destination: &Path,
        kind: SourceKind,
    ) -> Result<ExportResult, TransferError> {
        let select = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let query = format!(
            "SELECT {select} FROM {} FORMAT {}",
            quote_table(table)?,
            kind.export_format()
        );
        info!("Exporting {table} to {destination:?}");
        let body = self
            .gateway
            .run(&format!("export {table}"), |conn| conn.query(&query))?;

        let output = io_utils::open_output(destination)?;
        let rows_exported = match kind {
            SourceKind::Delimited => write_delimited_export(&body, output)?,
            SourceKind::Records => write_records_export(&body, output)?,
        };
        info!("Exported {rows_exported} row(s) from {table}");
        Ok(ExportResult {
            status: TransferStatus::Completed,
            rows_exported,
        })
    }

    /// Table names in the connected database.
    pub fn list_tables(&self) -> Result<Vec<String>, TransferError> {
        let body = self.gateway.run("list tables", |conn| {
            conn.query(
                "SELECT name FROM system.tables WHERE database = currentDatabase() \
                 ORDER BY name FORMAT TabSeparated",
            )
        })?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn row_count(&self, table: &str) -> Result<u64, TransferError> {
        let query = format!("SELECT count() FROM {} FORMAT TabSeparated", quote_table(table)?);
        self.gateway.run(&format!("count {table}"), |conn| {
            let body = conn.query(&query)?;
            body.trim().parse::<u64>().map_err(|_| {
                WarehouseError::Operation(format!("unexpected count response '{}'", body.trim()))
            })
        })
    }
}

fn check_width<S>(source: &S, schema: &Schema) -> Result<(), TransferError>
where
    S: RowSource + ?Sized,
{
    let width = source.column_names().len();
    if schema.len() != width {
        return Err(TransferError::InvalidSource {
            path: source.origin().to_path_buf(),
            reason: format!(
                "schema has {} column(s) but the source has {width}",
                schema.len()
            ),
        });
    }
    Ok(())
}

/// Copies a `CSVWithNames` body, re-quoted the way ingestion quotes rows.
fn write_delimited_export<W: Write>(body: &str, output: W) -> Result<usize, TransferError> {
    let mut reader = io_utils::open_csv_reader(body.as_bytes(), false);
    let mut writer = io_utils::open_csv_writer(output);
    let mut records = 0usize;
    for record in reader.byte_records() {
        writer.write_byte_record(&record?)?;
        records += 1;
    }
    writer.flush()?;
    // The first record is the header.
    Ok(records.saturating_sub(1))
}

/// Gathers a `JSONEachRow` body into one JSON array of objects.
fn write_records_export<W: Write>(body: &str, mut output: W) -> Result<usize, TransferError> {
    let records = body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<Value>)
        .collect::<Result<Vec<_>, _>>()?;
    serde_json::to_writer_pretty(&mut output, &records)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(records.len())
}
