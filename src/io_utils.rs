//! CSV reader and writer construction shared by ingestion and export.
//!
//! - **Readers** are strict: double-quote escaping, fixed field count taken from
//!   the header, so short or long rows surface as per-record errors.
//! - **Writers** quote every field (`QuoteStyle::Always`) and terminate rows with `\n`,
//!   which is also the bulk-load wire format for delimited sources.
//! - The `-` path convention routes through stdin/stdout.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use csv::{QuoteStyle, Terminator};

use crate::error::TransferError;

pub const DEFAULT_CSV_DELIMITER: u8 = b',';

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn open_csv_reader<R>(reader: R, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(DEFAULT_CSV_DELIMITER)
        .double_quote(true)
        .flexible(false);
    builder.from_reader(reader)
}

pub fn open_input(path: &Path) -> Result<Box<dyn Read>, TransferError> {
    let reader: Box<dyn Read> = if is_dash(path) {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(BufReader::new(File::open(path)?))
    };
    Ok(reader)
}

pub fn open_csv_reader_from_path(
    path: &Path,
    has_headers: bool,
) -> Result<csv::Reader<Box<dyn Read>>, TransferError> {
    Ok(open_csv_reader(open_input(path)?, has_headers))
}

pub fn open_output(path: &Path) -> Result<Box<dyn Write>, TransferError> {
    let writer: Box<dyn Write> = if is_dash(path) {
        Box::new(std::io::stdout())
    } else {
        Box::new(BufWriter::new(File::create(path)?))
    };
    Ok(writer)
}

fn csv_writer_builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(DEFAULT_CSV_DELIMITER)
        .quote_style(QuoteStyle::Always)
        .double_quote(true)
        .terminator(Terminator::Any(b'\n'));
    builder
}

pub fn open_csv_writer<W>(writer: W) -> csv::Writer<W>
where
    W: Write,
{
    csv_writer_builder().from_writer(writer)
}

/// Serializes one record as a fully quoted CSV line without its terminator.
pub fn serialize_csv_row<I, T>(fields: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv_writer_builder().from_writer(Vec::new());
    writer.write_record(fields).map_err(|err| err.to_string())?;
    let mut bytes = writer.into_inner().map_err(|err| err.to_string())?;
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|err| err.to_string())
}
