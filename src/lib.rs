pub mod cli;
pub mod ddl;
pub mod error;
pub mod gateway;
pub mod io_utils;
pub mod retry;
pub mod schema;
pub mod source;
pub mod transfer;

use std::{env, path::Path, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands},
    gateway::ClickHouseConnector,
    schema::Schema,
    source::{SourceKind, open_source},
    transfer::{BatchTransferEngine, ResultPayload, TransferConfig},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("flatfile_bridge", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Infer(args) => handle_infer(&args),
        Commands::Ddl(args) => handle_ddl(&args),
        Commands::Ingest(args) => handle_ingest(&args),
        Commands::Export(args) => handle_export(&args),
        Commands::Tables(args) => handle_tables(&args),
        Commands::Count(args) => handle_count(&args),
    }
}

fn load_or_infer_schema(
    input: &Path,
    format: Option<SourceKind>,
    schema: Option<&Path>,
) -> Result<Schema> {
    if let Some(path) = schema {
        return Schema::load(path).with_context(|| format!("Loading schema from {path:?}"));
    }
    let kind = SourceKind::resolve(input, format)?;
    let source = open_source(input, kind).with_context(|| format!("Opening {input:?}"))?;
    let schema = schema::infer_schema(source.as_ref())
        .with_context(|| format!("Inferring schema from {input:?}"))?;
    Ok(schema)
}

fn build_engine(
    connection: &cli::ConnectionArgs,
    config: TransferConfig,
) -> BatchTransferEngine<ClickHouseConnector> {
    let params = connection.params();
    debug!("Connection parameters: {params:?}");
    BatchTransferEngine::new(ClickHouseConnector::new(params), config)
}

fn handle_infer(args: &cli::InferArgs) -> Result<()> {
    let schema = load_or_infer_schema(&args.input, args.format, None)?;
    match &args.output {
        Some(path) => {
            schema
                .save(path)
                .with_context(|| format!("Writing schema to {path:?}"))?;
            info!(
                "Inferred schema for {} column(s) written to {path:?}",
                schema.len()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&schema)?),
    }
    Ok(())
}

fn handle_ddl(args: &cli::DdlArgs) -> Result<()> {
    let schema = load_or_infer_schema(&args.input, args.format, args.schema.as_deref())?;
    let ddl = ddl::build_ddl(&schema, &args.table)?;
    for statement in ddl.statements() {
        println!("{statement};");
    }
    Ok(())
}

fn handle_ingest(args: &cli::IngestArgs) -> Result<()> {
    let config = args.transfer.config().map_err(|err| anyhow!(err))?;
    let schema = match &args.schema {
        Some(path) => Some(
            Schema::load(path).with_context(|| format!("Loading schema from {path:?}"))?,
        ),
        None => None,
    };
    let engine = build_engine(&args.connection, config);
    let result = engine.ingest_file(&args.input, args.format, &args.table, schema);
    println!(
        "{}",
        serde_json::to_string(&ResultPayload::from_ingest(&result))?
    );
    let summary = result.with_context(|| format!("Ingesting {:?} into {}", args.input, args.table))?;
    if summary.row_errors > 0 {
        info!("{} malformed row(s) were skipped", summary.row_errors);
    }
    let rows = engine
        .row_count(&args.table)
        .with_context(|| format!("Counting rows in {}", args.table))?;
    info!("Row count for {}: {rows}", args.table);
    Ok(())
}

fn handle_export(args: &cli::ExportArgs) -> Result<()> {
    let config = args.transfer.config().map_err(|err| anyhow!(err))?;
    let kind = SourceKind::resolve(&args.output, args.format)?;
    let columns = args
        .columns
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .collect::<Vec<_>>();
    debug!("Export columns: {:?}", columns);
    let engine = build_engine(&args.connection, config);
    let result = engine.export(&args.table, &columns, &args.output, kind);
    if !io_utils::is_dash(&args.output) {
        println!(
            "{}",
            serde_json::to_string(&ResultPayload::from_export(&result))?
        );
    }
    result.with_context(|| format!("Exporting {} to {:?}", args.table, args.output))?;
    Ok(())
}

fn handle_tables(args: &cli::TablesArgs) -> Result<()> {
    let engine = build_engine(&args.connection, TransferConfig::default());
    for table in engine.list_tables().context("Listing tables")? {
        println!("{table}");
    }
    Ok(())
}

fn handle_count(args: &cli::CountArgs) -> Result<()> {
    let engine = build_engine(&args.connection, TransferConfig::default());
    let rows = engine
        .row_count(&args.table)
        .with_context(|| format!("Counting rows in {}", args.table))?;
    println!("{rows}");
    Ok(())
}
