use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use coprof_sync::{
    check_from_env, run_sync_once_from_env, ProviderSource, RunRequest, SyncError, SyncOptions,
    SyncOutcome, SyncRunSummary,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "coprof")]
#[command(version, about = "Import one company profile from Tracxn into an Airtable table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Import configuration file (defaults to $COPROF_CONFIG or ./config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Read company records from a saved provider response instead of Tracxn
    #[arg(long, global = true, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Insert even when the destination already holds the company's URL
    #[arg(long, global = true)]
    allow_duplicates: bool,

    /// Run every step except the final write
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, map and insert the configured company (default)
    Sync,
    /// Validate configuration and credentials without calling any service
    Check,
}

impl Cli {
    fn run_request(&self) -> RunRequest {
        RunRequest {
            config_path: self.config.clone(),
            provider: self
                .replay
                .clone()
                .map(ProviderSource::Recorded)
                .unwrap_or_default(),
            options: SyncOptions {
                allow_duplicates: self.allow_duplicates,
                dry_run: self.dry_run,
            },
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_summary(summary: &SyncRunSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    let table = format!("{}/{}", summary.location.base_id, summary.location.table_id);
    match &summary.outcome {
        SyncOutcome::Inserted { record_id, .. } => {
            println!("inserted {} into {table} as {record_id}", summary.domain);
        }
        SyncOutcome::Skipped { existing_record_id } => {
            println!(
                "skipped {}: already in {table} as {existing_record_id}",
                summary.domain
            );
        }
        SyncOutcome::DryRun { row, would_insert } => {
            let verdict = if *would_insert { "would insert" } else { "would skip (duplicate)" };
            println!("dry run for {} into {table}: {verdict}", summary.domain);
            println!("{}", serde_json::to_string_pretty(row)?);
        }
    }
    for failure in &summary.empty_fields {
        println!(
            "  left empty: {} -> {} ({})",
            failure.field, failure.column, failure.reason
        );
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let request = cli.run_request();

    match cli.command.as_ref().unwrap_or(&Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env(&request).await?;
            print_summary(&summary, cli.json)?;
        }
        Commands::Check => {
            let prepared = check_from_env(&request)?;
            let plan = &prepared.plan;
            println!(
                "configuration ok: base={} table={} domain={} check_duplicates={}",
                plan.location.base_id,
                plan.location.table_id,
                plan.domain,
                plan.check_duplicates && !cli.allow_duplicates
            );
            for (field, column) in plan.mapping.configured() {
                println!("  {field} -> {column}");
            }
        }
    }

    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<SyncError>()
        .map(SyncError::exit_code)
        .unwrap_or(1)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            error!(exit_code = code, "{err:#}");
            ExitCode::from(code)
        }
    }
}
