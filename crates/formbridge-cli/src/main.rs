use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use formbridge_sync::{SyncConfig, SyncOptions, SyncReport, SyncRequest, VerifyReport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "formbridge")]
#[command(about = "Sync onboarding form submissions into the client workspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest exports and/or the live form and fill matched records.
    Sync(SyncArgs),
    /// Audit destination records without writing anything.
    Verify {
        #[arg(long)]
        json: bool,
    },
    /// Run the API sync on FORMBRIDGE_SCHEDULE_CRON until interrupted.
    Schedule {
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// V1 (original form) CSV export.
    #[arg(long = "v1", value_name = "PATH")]
    v1: Option<PathBuf>,
    /// V2 (capability-level form) CSV export.
    #[arg(long = "v2", value_name = "PATH")]
    v2: Option<PathBuf>,
    /// Pull responses from the Typeform API.
    #[arg(long)]
    api: bool,
    #[arg(long)]
    dry_run: bool,
    /// Match through destination name search instead of listing every record.
    #[arg(long)]
    remote_search: bool,
    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

impl SyncArgs {
    fn request(&self) -> SyncRequest {
        SyncRequest {
            v1_export: self.v1.clone(),
            v2_export: self.v2.clone(),
            api: self.api,
            options: SyncOptions {
                dry_run: self.dry_run,
                remote_search: self.remote_search,
            },
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_sync_summary(report: &SyncReport) {
    println!(
        "sync {}: run_id={} processed={} updated={} skipped={} not_found={} warnings={} errors={}",
        if report.dry_run { "planned (dry run)" } else { "complete" },
        report.run_id,
        report.processed,
        report.updated,
        report.skipped,
        report.not_found,
        report.warnings,
        report.errors
    );
    for tally in &report.sources {
        println!(
            "  {}: rows={} extracted={} unique={} updated={} skipped={} not_found={} errors={}",
            tally.label,
            tally.fetched,
            tally.extracted,
            tally.unique,
            tally.updated,
            tally.skipped,
            tally.not_found,
            tally.errors
        );
    }
    if !report.fields_added.is_empty() {
        println!("  fields added: {}", report.fields_added.join(", "));
    }
}

fn print_verify_summary(report: &VerifyReport) {
    println!(
        "verify complete: run_id={} checked={} complete={} findings={}",
        report.run_id,
        report.checked,
        report.complete_records,
        report.findings.len()
    );
    for finding in &report.findings {
        println!(
            "  {:?} {} [{}]: {}",
            finding.kind, finding.record_name, finding.field, finding.detail
        );
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync(args) => {
            let request = args.request();
            if !request.has_sources() {
                bail!("nothing to sync: pass --v1, --v2 and/or --api");
            }
            let report = formbridge_sync::run_sync_from_env(&request).await?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("encoding sync report")?
                );
            } else {
                print_sync_summary(&report);
            }
            if report.all_failed() {
                tracing::error!(errors = report.errors, "every processed record failed");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Verify { json } => {
            let report = formbridge_sync::run_verify_from_env().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("encoding verify report")?
                );
            } else {
                print_verify_summary(&report);
            }
        }
        Commands::Schedule { dry_run } => {
            let config = SyncConfig::from_env(true)?;
            let cron = config.schedule_cron.clone();
            let options = SyncOptions {
                dry_run,
                ..SyncOptions::default()
            };
            let mut sched = formbridge_sync::build_scheduler(config, options).await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, dry_run, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
