//! Command-line interface for delta-engine tables.
//!
//! Exit codes: 0 success, 1 concurrency failure after retries, 2 validation
//! error, 3 storage error.

use std::collections::HashMap;
use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use delta_engine::ops::{
    ClusteringOptions, CompactionOptions, CompactionStrategy, CurveKind, DedupeOptions,
    KeepStrategy, VacuumOptions,
};
use delta_engine::schema::StructType;
use delta_engine::table::DeleteStrategy;
use delta_engine::{Error, Filter, Row, Table, Value};

#[derive(Parser)]
#[command(name = "delta-engine", version, about = "Delta-compatible table engine")]
struct Cli {
    /// Table URI: file path, file://, memory://, s3://, or r2://
    #[arg(long, global = true, default_value = ".")]
    table: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new table
    Create {
        /// Schema as a Delta schemaString JSON document
        #[arg(long)]
        schema: String,
        /// Partition columns, comma separated
        #[arg(long)]
        partition_by: Option<String>,
        /// Table properties as key=value, repeatable
        #[arg(long = "property")]
        properties: Vec<String>,
    },
    /// Append rows (newline-delimited JSON from a file, or `-` for stdin)
    Write {
        #[arg(long, default_value = "-")]
        input: String,
    },
    /// Read rows as newline-delimited JSON
    Read {
        /// MongoDB-style filter document
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Update rows matching a filter
    Update {
        #[arg(long)]
        filter: String,
        /// Column assignments as a JSON object
        #[arg(long = "set")]
        assignments: String,
    },
    /// Delete rows matching a filter
    Delete {
        #[arg(long)]
        filter: String,
        #[arg(long, default_value = "auto")]
        strategy: DeleteStrategy,
    },
    /// Upsert rows keyed on the given columns
    Merge {
        #[arg(long, default_value = "-")]
        input: String,
        /// Match key columns, comma separated
        #[arg(long)]
        on: String,
    },
    /// Bin-pack small files
    Compact {
        #[arg(long)]
        target_size: Option<u64>,
        #[arg(long, default_value = "bin-packing")]
        strategy: CompactionStrategy,
        #[arg(long)]
        verify: bool,
    },
    /// Remove duplicate rows
    Deduplicate {
        /// Key columns, comma separated (defaults to configured primary keys)
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value = "first")]
        keep: KeepStrategy,
        #[arg(long)]
        order_by: Option<String>,
        /// Group by full row content instead of key columns
        #[arg(long)]
        exact: bool,
    },
    /// Re-sort the table along a space-filling curve
    Cluster {
        /// Clustering columns, comma separated
        #[arg(long)]
        columns: String,
        #[arg(long, default_value = "z-order")]
        curve: CurveKind,
        #[arg(long, default_value_t = 21)]
        bits: u32,
    },
    /// Physically remove tombstoned files past retention
    Vacuum {
        #[arg(long)]
        retention_ms: Option<i64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show commit history, newest first
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn exit_code_for(err: &Error) -> u8 {
    use delta_engine::CdcErrorKind as Cdc;
    match err {
        Error::Concurrency { .. } | Error::VersionMismatch { .. } => 1,
        Error::Validation(_)
        | Error::UnrecognizedAction(_)
        | Error::InvalidUrl(_)
        | Error::UnsupportedScheme(_)
        | Error::InvalidDeletionVector(_)
        | Error::Json(_) => 2,
        Error::ChangeDataCapture { kind, .. } => match kind {
            Cdc::InvalidVersionRange | Cdc::InvalidTimeRange | Cdc::CdcNotEnabled => 2,
            _ => 3,
        },
        _ => 3,
    }
}

fn read_rows(input: &str) -> anyhow::Result<Vec<Row>> {
    let text = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(input)?
    };
    let rows = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect::<Result<Vec<Row>, _>>()?;
    Ok(rows)
}

fn parse_filter(filter: Option<&str>) -> anyhow::Result<Filter> {
    match filter {
        Some(text) => Ok(Filter::parse(&serde_json::from_str(text)?)?),
        None => Ok(Filter::all()),
    }
}

fn split_columns(text: &str) -> Vec<String> {
    text.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let table = Table::try_from_uri(&cli.table)?;
    match cli.command {
        Command::Create {
            schema,
            partition_by,
            properties,
        } => {
            let schema = StructType::from_schema_string(&schema)?;
            let mut configuration = HashMap::new();
            for property in properties {
                let (key, value) = property.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("--property expects key=value, got {property:?}")
                })?;
                configuration.insert(key.to_string(), value.to_string());
            }
            let mut builder = table.create(schema).with_configuration(configuration);
            if let Some(columns) = partition_by {
                builder = builder.with_partition_columns(split_columns(&columns));
            }
            builder.execute().await?;
            eprintln!("created table at {}", cli.table);
        }
        Command::Write { input } => {
            let rows = read_rows(&input)?;
            let result = table.write(rows).await?;
            print_json(&result)?;
        }
        Command::Read { filter, limit } => {
            let filter = parse_filter(filter.as_deref())?;
            let mut rows = table.read(&filter).await?;
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Command::Update {
            filter,
            assignments,
        } => {
            let filter = parse_filter(Some(&filter))?;
            let assignments: HashMap<String, Value> = serde_json::from_str(&assignments)?;
            let result = table.update(&filter, &assignments).await?;
            print_json(&result)?;
        }
        Command::Delete { filter, strategy } => {
            let filter = parse_filter(Some(&filter))?;
            let result = table
                .delete_with(&filter, strategy, Default::default())
                .await?;
            print_json(&result)?;
        }
        Command::Merge { input, on } => {
            let rows = read_rows(&input)?;
            let result = table.merge(split_columns(&on)).execute(rows).await?;
            print_json(&result)?;
        }
        Command::Compact {
            target_size,
            strategy,
            verify,
        } => {
            let result = table
                .compact(CompactionOptions {
                    target_file_size: target_size,
                    strategy,
                    verify_integrity: verify,
                    ..Default::default()
                })
                .await?;
            print_json(&result)?;
        }
        Command::Deduplicate {
            key,
            keep,
            order_by,
            exact,
        } => {
            let result = table
                .deduplicate(DedupeOptions {
                    primary_key: key.as_deref().map(split_columns).unwrap_or_default(),
                    exact_duplicates: exact,
                    keep,
                    order_by,
                    ..Default::default()
                })
                .await?;
            print_json(&result)?;
        }
        Command::Cluster {
            columns,
            curve,
            bits,
        } => {
            let result = table
                .cluster(ClusteringOptions {
                    curve,
                    bits,
                    ..ClusteringOptions::new(split_columns(&columns))
                })
                .await?;
            print_json(&result)?;
        }
        Command::Vacuum {
            retention_ms,
            dry_run,
        } => {
            let result = table
                .vacuum(VacuumOptions {
                    retention_ms,
                    dry_run,
                    ..Default::default()
                })
                .await?;
            print_json(&result)?;
        }
        Command::History { limit } => {
            let entries = table.history(limit).await?;
            print_json(&entries)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = match err.downcast_ref::<Error>() {
                Some(engine_err) => exit_code_for(engine_err),
                None => 2,
            };
            ExitCode::from(code)
        }
    }
}
