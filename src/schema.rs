//! Column schema model and sample-based type inference.
//!
//! A [`Schema`] is an ordered list of [`Column`]s in source column order. Types
//! come from a small sample read off the front of the source: each column is
//! judged on its own, and the decision is fixed once made.

use std::{
    collections::HashSet,
    fs::File,
    io::BufReader,
    path::Path,
    sync::OnceLock,
};

use anyhow::{Context, Result};
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::TransferError, source::SampleSource};

/// Number of leading data rows consulted by inference.
pub const SAMPLE_ROWS: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TypeTag {
    String,
    Integer32,
    DateTime,
}

impl TypeTag {
    /// Column type used in warehouse DDL.
    pub fn warehouse_type(&self) -> &'static str {
        match self {
            TypeTag::String => "String",
            TypeTag::Integer32 => "Int32",
            TypeTag::DateTime => "DateTime",
        }
    }

    /// Whether a textual value can be loaded into a column of this type.
    /// Empty values are always accepted; the warehouse stores the column default.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            _ if value.is_empty() => true,
            TypeTag::String => true,
            TypeTag::Integer32 => is_integer32(value),
            TypeTag::DateTime => is_datetime(value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: TypeTag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("Creating schema file {path:?}"))?;
        serde_json::to_writer_pretty(file, self).context("Writing schema JSON")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let reader = BufReader::new(file);
        let schema: Schema = serde_json::from_reader(reader).context("Parsing schema JSON")?;
        anyhow::ensure!(!schema.is_empty(), "Schema file {path:?} defines no columns");
        Ok(schema)
    }
}

/// Replaces every character outside `[A-Za-z0-9_]` with `_` and lower-cases the result.
pub fn sanitize_column_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Sanitizes a full header. Empty names become `column_<n>` and repeats get a
/// numeric suffix so that every column stays addressable.
pub fn sanitize_header(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(names.len());
    names
        .iter()
        .enumerate()
        .map(|(idx, raw)| {
            let mut name = sanitize_column_name(raw);
            if name.is_empty() {
                name = format!("column_{}", idx + 1);
            }
            if !seen.contains(&name) {
                seen.insert(name.clone());
                return name;
            }
            let mut suffix = 2;
            loop {
                let candidate = format!("{name}_{suffix}");
                if seen.insert(candidate.clone()) {
                    debug!("Renamed duplicate column '{raw}' to '{candidate}'");
                    return candidate;
                }
                suffix += 1;
            }
        })
        .collect()
}

fn datetime_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}( [0-9]{2}:[0-9]{2}:[0-9]{2})?$")
            .expect("datetime pattern is valid")
    })
}

pub fn is_integer32(value: &str) -> bool {
    value.parse::<i32>().is_ok()
}

/// `YYYY-MM-DD` with an optional ` HH:MM:SS`. Shape only, no calendar check.
pub fn is_datetime(value: &str) -> bool {
    datetime_pattern().is_match(value)
}

#[derive(Debug, Clone)]
struct TypeCandidate {
    seen_value: bool,
    possible_integer: bool,
    possible_datetime: bool,
}

impl TypeCandidate {
    fn new() -> Self {
        Self {
            seen_value: false,
            possible_integer: true,
            possible_datetime: true,
        }
    }

    fn observe(&mut self, value: &str) {
        self.seen_value = true;
        if self.possible_integer && !is_integer32(value) {
            self.possible_integer = false;
        }
        if self.possible_datetime && !is_datetime(value) {
            self.possible_datetime = false;
        }
    }

    fn decide(&self) -> TypeTag {
        if !self.seen_value {
            TypeTag::String
        } else if self.possible_integer {
            TypeTag::Integer32
        } else if self.possible_datetime {
            TypeTag::DateTime
        } else {
            TypeTag::String
        }
    }
}

/// Infers one column's type from its sampled values. Absent and empty values are ignored.
pub fn infer_column_type<'a, I>(values: I) -> TypeTag
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut candidate = TypeCandidate::new();
    for value in values.into_iter().flatten() {
        if value.is_empty() {
            continue;
        }
        candidate.observe(value);
    }
    candidate.decide()
}

/// Produces the schema for any source exposing column names and a sample.
pub fn infer_schema<S>(source: &S) -> Result<Schema, TransferError>
where
    S: SampleSource + ?Sized,
{
    let names = source.column_names();
    if names.is_empty() {
        return Err(TransferError::EmptySource {
            path: source.origin().to_path_buf(),
            reason: "no columns found".to_string(),
        });
    }
    let sample = source.sample();
    let sanitized = sanitize_header(names);
    let columns = sanitized
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            let data_type = infer_column_type(
                sample
                    .iter()
                    .map(|row| row.get(idx).and_then(|value| value.as_deref())),
            );
            Column { name, data_type }
        })
        .collect::<Vec<_>>();
    debug!(
        "Inferred {} column(s) from {} sampled row(s) of {:?}",
        columns.len(),
        sample.len(),
        source.origin()
    );
    Ok(Schema { columns })
}
