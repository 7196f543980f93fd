//! Table (re)creation statements derived from an inferred [`Schema`].

use itertools::Itertools;

use crate::{
    error::TransferError,
    schema::{Column, Schema, TypeTag},
};

pub const TABLE_ENGINE: &str = "MergeTree";

/// Statements that replace a table. `drop` always runs before `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDdl {
    pub drop: String,
    pub create: String,
    pub order_by: String,
}

impl TableDdl {
    pub fn statements(&self) -> [&str; 2] {
        [&self.drop, &self.create]
    }
}

/// First `DateTime` column in schema order, else the first column.
pub fn ordering_key(schema: &Schema) -> Option<&Column> {
    schema
        .columns
        .iter()
        .find(|c| c.data_type == TypeTag::DateTime)
        .or_else(|| schema.columns.first())
}

pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

/// Quotes `table` or `database.table`.
pub fn quote_table(table: &str) -> Result<String, TransferError> {
    let trimmed = table.trim();
    let parts = trimmed.split('.').collect::<Vec<_>>();
    if trimmed.is_empty()
        || parts.len() > 2
        || parts.iter().any(|p| p.is_empty())
        || trimmed.chars().any(char::is_control)
    {
        return Err(TransferError::InvalidTable(table.to_string()));
    }
    Ok(parts.into_iter().map(quote_identifier).join("."))
}

pub fn build_ddl(schema: &Schema, table: &str) -> Result<TableDdl, TransferError> {
    let quoted = quote_table(table)?;
    let Some(key) = ordering_key(schema) else {
        return Err(TransferError::InvalidTable(format!(
            "{table} (schema has no columns)"
        )));
    };
    let columns = schema
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {}",
                quote_identifier(&c.name),
                c.data_type.warehouse_type()
            )
        })
        .join(", ");
    let order_by = quote_identifier(&key.name);
    Ok(TableDdl {
        drop: format!("DROP TABLE IF EXISTS {quoted}"),
        create: format!(
            "CREATE TABLE IF NOT EXISTS {quoted} ({columns}) ENGINE={TABLE_ENGINE} ORDER BY {order_by}"
        ),
        order_by,
    })
}
