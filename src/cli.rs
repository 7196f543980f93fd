use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    gateway::{ConnectionParams, DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_USER},
    retry::{DEFAULT_MAX_ATTEMPTS, RetryPolicy},
    source::SourceKind,
    transfer::{DEFAULT_BATCH_SIZE, TransferConfig},
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Move CSV and JSON files in and out of ClickHouse tables", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Infer a column schema from the first rows of a CSV or JSON file
    Infer(InferArgs),
    /// Print the DROP/CREATE statements a load would run
    Ddl(DdlArgs),
    /// Recreate a table from a file and load every row into it in batches
    Ingest(IngestArgs),
    /// Export table columns to a CSV or JSON file
    Export(ExportArgs),
    /// List tables in the configured database
    Tables(TablesArgs),
    /// Count rows in a table
    Count(CountArgs),
}

#[derive(Debug, Args)]
pub struct InferArgs {
    /// Input CSV or JSON file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Input format (derived from the file extension when omitted)
    #[arg(long, value_enum)]
    pub format: Option<SourceKind>,
    /// Write the schema JSON here instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DdlArgs {
    /// Input CSV or JSON file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Input format (derived from the file extension when omitted)
    #[arg(long, value_enum)]
    pub format: Option<SourceKind>,
    /// Use this schema file instead of inferring one
    #[arg(short = 's', long = "schema")]
    pub schema: Option<PathBuf>,
    /// Target table name (`table` or `database.table`)
    #[arg(short = 't', long = "table")]
    pub table: String,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Input CSV or JSON file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Input format (derived from the file extension when omitted)
    #[arg(long, value_enum)]
    pub format: Option<SourceKind>,
    /// Use this schema file instead of inferring one
    #[arg(short = 's', long = "schema")]
    pub schema: Option<PathBuf>,
    /// Target table; it is dropped and recreated
    #[arg(short = 't', long = "table")]
    pub table: String,
    #[command(flatten)]
    pub transfer: TransferArgs,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Table to read from
    #[arg(short = 't', long = "table")]
    pub table: String,
    /// Destination file (`-` for stdout)
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
    /// Columns to export (all columns when omitted)
    #[arg(short = 'C', long = "columns", value_delimiter = ',')]
    pub columns: Vec<String>,
    /// Output format (derived from the file extension when omitted)
    #[arg(long, value_enum)]
    pub format: Option<SourceKind>,
    #[command(flatten)]
    pub transfer: TransferArgs,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Debug, Args)]
pub struct TablesArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Debug, Args)]
pub struct CountArgs {
    /// Table to count
    #[arg(short = 't', long = "table")]
    pub table: String,
    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Warehouse host
    #[arg(long, env = "CLICKHOUSE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,
    /// HTTP interface port
    #[arg(long, env = "CLICKHOUSE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Database holding the tables
    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: String,
    /// User name
    #[arg(long, env = "CLICKHOUSE_USER", default_value = DEFAULT_USER)]
    pub user: String,
    /// Access token or password
    #[arg(long, env = "CLICKHOUSE_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,
    /// Use HTTPS
    #[arg(long)]
    pub secure: bool,
    /// Per-request timeout in seconds
    #[arg(long = "timeout-secs", default_value_t = 30)]
    pub timeout_secs: u64,
}

impl ConnectionArgs {
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            token: self.token.clone(),
            secure: self.secure,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct TransferArgs {
    /// Rows per bulk insert
    #[arg(long = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// Attempts per warehouse operation before giving up
    #[arg(long = "max-attempts", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[arg(long = "retry-delay-ms", default_value_t = 1000)]
    pub retry_delay_ms: u64,
}

impl TransferArgs {
    pub fn config(&self) -> Result<TransferConfig, String> {
        let retry = RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )?;
        TransferConfig::new(self.batch_size, retry)
    }
}
