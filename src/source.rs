//! Flat-file sources: delimited text (CSV) and record-oriented text (a JSON array
//! of flat objects).
//!
//! Both readers expose the same [`SampleSource`] capability to inference and the
//! same [`RowSource`] stream to the transfer engine, which turns every data row
//! into the bulk-load wire format of its kind or reports it as malformed.

use std::{
    collections::VecDeque,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use csv::StringRecord;
use log::debug;
use serde_json::{Map, Value};

use crate::{
    error::{RowParseError, TransferError},
    io_utils,
    schema::{SAMPLE_ROWS, Schema, TypeTag},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Comma separated values with a header row
    #[value(name = "csv")]
    Delimited,
    /// A JSON array of flat objects
    #[value(name = "json")]
    Records,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Result<Self, TransferError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Ok(SourceKind::Delimited),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(SourceKind::Records),
            _ => Err(TransferError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    /// An explicit kind wins over the file extension.
    pub fn resolve(path: &Path, provided: Option<SourceKind>) -> Result<Self, TransferError> {
        match provided {
            Some(kind) => Ok(kind),
            None => Self::from_path(path),
        }
    }

    /// Format name used by bulk inserts.
    pub fn insert_format(&self) -> &'static str {
        match self {
            SourceKind::Delimited => "CSV",
            SourceKind::Records => "JSONEachRow",
        }
    }

    /// Format name requested from the warehouse when exporting.
    pub fn export_format(&self) -> &'static str {
        match self {
            SourceKind::Delimited => "CSVWithNames",
            SourceKind::Records => "JSONEachRow",
        }
    }
}

/// Sampled row values aligned with [`SampleSource::column_names`]; `None` marks an absent value.
pub type SampleRow = Vec<Option<String>>;

/// What inference needs from a source, independent of its format.
pub trait SampleSource {
    fn origin(&self) -> &Path;
    fn column_names(&self) -> &[String];
    fn sample(&self) -> &[SampleRow];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// A row in the bulk wire format, without a line terminator.
    Serialized(String),
    Malformed(RowParseError),
}

pub trait RowSource: SampleSource {
    fn kind(&self) -> SourceKind;

    /// Next data row in source order. `Ok(None)` marks the end of the source;
    /// `Err` is reserved for failures that make the rest of the source unreadable.
    fn next_row(&mut self, schema: &Schema) -> Result<Option<RowOutcome>, TransferError>;
}

pub fn open_source(
    path: &Path,
    kind: SourceKind,
) -> Result<Box<dyn RowSource>, TransferError> {
    match kind {
        SourceKind::Delimited => Ok(Box::new(DelimitedSource::open(path)?)),
        SourceKind::Records => Ok(Box::new(RecordSource::open(path)?)),
    }
}

type PendingRecord = (usize, Result<StringRecord, csv::Error>);

pub struct DelimitedSource<R: Read> {
    origin: PathBuf,
    reader: csv::Reader<R>,
    headers: Vec<String>,
    sample: Vec<SampleRow>,
    pending: VecDeque<PendingRecord>,
    row_number: usize,
}

impl DelimitedSource<Box<dyn Read>> {
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let reader = io_utils::open_csv_reader_from_path(path, true)?;
        DelimitedSource::from_csv_reader(path, reader)
    }
}

impl<R: Read> DelimitedSource<R> {
    pub fn from_reader(origin: &Path, reader: R) -> Result<Self, TransferError> {
        Self::from_csv_reader(origin, io_utils::open_csv_reader(reader, true))
    }

    fn from_csv_reader(origin: &Path, mut reader: csv::Reader<R>) -> Result<Self, TransferError> {
        let headers = match reader.headers() {
            Ok(record) => record.iter().map(str::to_string).collect::<Vec<_>>(),
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                return Err(TransferError::InvalidSource {
                    path: origin.to_path_buf(),
                    reason: format!("unreadable header row: {err}"),
                });
            }
        };
        if headers.is_empty() {
            return Err(TransferError::EmptySource {
                path: origin.to_path_buf(),
                reason: "missing header row".to_string(),
            });
        }

        let mut source = Self {
            origin: origin.to_path_buf(),
            reader,
            headers,
            sample: Vec::new(),
            pending: VecDeque::with_capacity(SAMPLE_ROWS),
            // Row 1 is the header.
            row_number: 2,
        };
        source.fill_sample()?;
        Ok(source)
    }

    fn fill_sample(&mut self) -> Result<(), TransferError> {
        while self.pending.len() < SAMPLE_ROWS {
            let row = self.row_number;
            let Some(result) = self.read_record()? else {
                break;
            };
            if let Ok(record) = &result {
                self.sample
                    .push(record.iter().map(|v| Some(v.to_string())).collect());
            }
            self.pending.push_back((row, result));
        }
        Ok(())
    }

    /// Reads one record, keeping per-record parse failures for the caller.
    fn read_record(&mut self) -> Result<Option<Result<StringRecord, csv::Error>>, TransferError> {
        let mut record = StringRecord::new();
        match self.reader.read_record(&mut record) {
            Ok(true) => {
                self.row_number += 1;
                Ok(Some(Ok(record)))
            }
            Ok(false) => Ok(None),
            Err(err) if err.is_io_error() => Err(err.into()),
            Err(err) => {
                self.row_number += 1;
                Ok(Some(Err(err)))
            }
        }
    }
}

impl<R: Read> SampleSource for DelimitedSource<R> {
    fn origin(&self) -> &Path {
        &self.origin
    }

    fn column_names(&self) -> &[String] {
        &self.headers
    }

    fn sample(&self) -> &[SampleRow] {
        &self.sample
    }
}

impl<R: Read> RowSource for DelimitedSource<R> {
    fn kind(&self) -> SourceKind {
        SourceKind::Delimited
    }

    fn next_row(&mut self, schema: &Schema) -> Result<Option<RowOutcome>, TransferError> {
        let (row, result) = match self.pending.pop_front() {
            Some(pending) => pending,
            None => {
                let row = self.row_number;
                match self.read_record()? {
                    Some(result) => (row, result),
                    None => return Ok(None),
                }
            }
        };
        let outcome = match result {
            Ok(record) => match check_fields(&record, schema)
                .and_then(|()| io_utils::serialize_csv_row(record.iter()))
            {
                Ok(line) => RowOutcome::Serialized(line),
                Err(message) => RowOutcome::Malformed(RowParseError { row, message }),
            },
            Err(err) => RowOutcome::Malformed(RowParseError {
                row,
                message: err.to_string(),
            }),
        };
        Ok(Some(outcome))
    }
}

/// Rejects a record holding a value its column type cannot load.
fn check_fields(record: &StringRecord, schema: &Schema) -> Result<(), String> {
    for (value, column) in record.iter().zip(&schema.columns) {
        if !column.data_type.accepts(value) {
            return Err(type_mismatch(&column.name, column.data_type, value));
        }
    }
    Ok(())
}

fn type_mismatch(column: &str, data_type: TypeTag, value: &str) -> String {
    format!(
        "value '{value}' in column '{column}' is not a valid {}",
        data_type.warehouse_type()
    )
}

/// JSON counterpart of [`TypeTag::accepts`]: numbers must fit `Int32`,
/// date-times must be strings of the accepted shape.
fn record_value_fits(data_type: TypeTag, value: &Value) -> bool {
    match (data_type, value) {
        (_, Value::Null) | (TypeTag::String, _) => true,
        (TypeTag::Integer32, Value::Number(number)) => number
            .as_i64()
            .is_some_and(|v| i32::try_from(v).is_ok()),
        (_, Value::String(text)) => data_type.accepts(text),
        _ => false,
    }
}

pub struct RecordSource {
    origin: PathBuf,
    keys: Vec<String>,
    sample: Vec<SampleRow>,
    records: std::vec::IntoIter<Value>,
    row_number: usize,
}

impl RecordSource {
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let text = if io_utils::is_dash(path) {
            let mut buffer = String::new();
            io_utils::open_input(path)?.read_to_string(&mut buffer)?;
            buffer
        } else {
            fs::read_to_string(path)?
        };
        Self::from_json(path, &text)
    }

    pub fn from_json(origin: &Path, text: &str) -> Result<Self, TransferError> {
        let invalid = |reason: String| TransferError::InvalidSource {
            path: origin.to_path_buf(),
            reason,
        };
        let document: Value = serde_json::from_str(text)
            .map_err(|err| invalid(format!("not a JSON document: {err}")))?;
        let Value::Array(records) = document else {
            return Err(invalid("top level must be an array of records".to_string()));
        };
        let Some(first) = records.first() else {
            return Err(TransferError::EmptySource {
                path: origin.to_path_buf(),
                reason: "record array is empty".to_string(),
            });
        };
        let Value::Object(first) = first else {
            return Err(invalid("first record is not an object".to_string()));
        };
        let keys = first.keys().cloned().collect::<Vec<_>>();

        let sample = records
            .iter()
            .take(SAMPLE_ROWS)
            .filter_map(Value::as_object)
            .map(|record| {
                keys.iter()
                    .map(|key| record.get(key).and_then(sample_text))
                    .collect()
            })
            .collect();

        Ok(Self {
            origin: origin.to_path_buf(),
            keys,
            sample,
            records: records.into_iter(),
            row_number: 1,
        })
    }

    fn serialize(&self, record: &Value, schema: &Schema) -> Result<String, String> {
        let Value::Object(fields) = record else {
            return Err("record is not an object".to_string());
        };
        let mut row = Map::with_capacity(self.keys.len());
        for (key, column) in self.keys.iter().zip(&schema.columns) {
            match fields.get(key) {
                None => {}
                Some(Value::Object(_) | Value::Array(_)) => {
                    return Err(format!("field '{key}' holds a nested value"));
                }
                Some(value) if !record_value_fits(column.data_type, value) => {
                    return Err(type_mismatch(&column.name, column.data_type, &value.to_string()));
                }
                Some(value) => {
                    row.insert(column.name.clone(), value.clone());
                }
            }
        }
        if fields.len() > row.len() {
            debug!(
                "Record {} carries {} field(s) outside the schema",
                self.row_number,
                fields.keys().filter(|k| !self.keys.contains(k)).count()
            );
        }
        serde_json::to_string(&Value::Object(row)).map_err(|err| err.to_string())
    }
}

/// Text form of a JSON scalar as seen by type inference.
fn sample_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl SampleSource for RecordSource {
    fn origin(&self) -> &Path {
        &self.origin
    }

    fn column_names(&self) -> &[String] {
        &self.keys
    }

    fn sample(&self) -> &[SampleRow] {
        &self.sample
    }
}

impl RowSource for RecordSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Records
    }

    fn next_row(&mut self, schema: &Schema) -> Result<Option<RowOutcome>, TransferError> {
        let Some(record) = self.records.next() else {
            return Ok(None);
        };
        let row = self.row_number;
        let outcome = match self.serialize(&record, schema) {
            Ok(line) => RowOutcome::Serialized(line),
            Err(message) => RowOutcome::Malformed(RowParseError { row, message }),
        };
        self.row_number += 1;
        Ok(Some(outcome))
    }
}
