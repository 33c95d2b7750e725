use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pricesync_adapters::{SourcePriceFeed, UpdateStrategy};
use pricesync_core::{format_price, PendingUpdate};
use pricesync_storage::{HttpClientConfig, HttpFetcher};
use pricesync_sync::{
    plan_from_files, ExecutionEvent, Reconciliation, SyncConfig, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricesync")]
#[command(about = "Reconcile a price-list feed against a shop catalog and push corrections")]
struct Cli {
    /// YAML config layered under `PRICESYNC_*` env vars (default: ./pricesync.yaml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the price-list feed as `SKU | Price`.
    Feed {
        #[arg(long)]
        url: Option<String>,
    },
    /// Reconcile without sending any update.
    Plan(PlanArgs),
    /// Reconcile and apply every pending update.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Saved feed JSON; requires --catalog-file and skips the network entirely.
    #[arg(long, requires = "catalog_file")]
    feed_file: Option<PathBuf>,

    /// Saved catalog JSON (a products page or a bare product array).
    #[arg(long, requires = "feed_file")]
    catalog_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Write the failure report here instead of the per-run reports directory.
    #[arg(long, value_name = "PATH")]
    export_failures: Option<PathBuf>,

    /// Do not write a failure report at all.
    #[arg(long, conflicts_with = "export_failures")]
    no_export: bool,

    #[arg(long)]
    concurrency: Option<usize>,

    /// `direct` (variant PUT) or `graph` (productUpdate mutation).
    #[arg(long)]
    strategy: Option<UpdateStrategy>,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Feed { url } => {
            print_feed(cli.config.as_deref(), url).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan(args) => {
            let reconciliation = match (args.feed_file, args.catalog_file) {
                (Some(feed), Some(catalog)) => plan_from_files(&feed, &catalog)?,
                _ => {
                    let config = SyncConfig::load(cli.config.as_deref())?;
                    SyncPipeline::new(config)?.plan().await?.reconciliation
                }
            };
            print_plan(&reconciliation);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync(args) => run_sync(cli.config, args).await,
    }
}

/// `--url` wins over the layered config's `feed_url`.
fn feed_settings<F>(
    config_path: Option<&Path>,
    url: Option<String>,
    lookup: F,
) -> Result<(String, HttpClientConfig)>
where
    F: Fn(&str) -> Option<String>,
{
    let config = SyncConfig::resolve(config_path, lookup)?;
    let url = url.unwrap_or_else(|| config.feed_url.clone());
    Ok((url, config.http_client_config()))
}

async fn print_feed(config_path: Option<&Path>, url: Option<String>) -> Result<()> {
    let (url, http_config) = feed_settings(config_path, url, |key| std::env::var(key).ok())?;
    let http = HttpFetcher::new(http_config)?;
    let snapshot = SourcePriceFeed::new(url.clone())
        .fetch(&http)
        .await
        .with_context(|| format!("fetching price feed {url}"))?;

    if snapshot.entries.is_empty() {
        eprintln!("no data found in the price list");
        return Ok(());
    }
    println!("SKU | Price");
    for entry in &snapshot.entries {
        println!("{} | {}", entry.sku, format_price(entry.price));
    }
    if !snapshot.rejected.is_empty() {
        eprintln!("{} record(s) skipped", snapshot.rejected.len());
    }
    Ok(())
}

fn describe(update: &PendingUpdate) -> String {
    format!(
        "{} | {} / {} | {} -> {}",
        update.sku,
        update.product_title,
        update.variant_title,
        format_price(update.current_price),
        format_price(update.new_price)
    )
}

fn print_plan(reconciliation: &Reconciliation) {
    let stats = &reconciliation.stats;
    for update in &reconciliation.updates {
        println!("{}", describe(update));
    }
    for warning in &reconciliation.warnings {
        eprintln!(
            "warning: variant {} (sku {}) has unreadable price {:?}",
            warning.variant_id, warning.sku, warning.raw_price
        );
    }
    println!(
        "pending={} in_sync={} unmatched={} no_sku={} warnings={}",
        stats.pending,
        stats.in_sync,
        stats.unmatched,
        stats.skipped_no_sku,
        reconciliation.warnings.len()
    );
}

async fn run_sync(config_path: Option<PathBuf>, args: SyncArgs) -> Result<ExitCode> {
    let mut config = SyncConfig::load(config_path.as_deref())?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(strategy) = args.strategy {
        config.update_strategy = strategy;
    }
    if args.no_export {
        config.export_failures = false;
    }
    config.validate()?;
    info!(
        shop = %config.shop,
        strategy = %config.update_strategy,
        concurrency = config.concurrency,
        "starting sync"
    );

    let pipeline = SyncPipeline::new(config)?;
    let plan = pipeline.plan().await?;
    if plan.reconciliation.updates.is_empty() {
        eprintln!("catalog already matches the price list");
    }

    let summary = pipeline
        .execute(&plan, |event, progress| {
            if let ExecutionEvent::Finished { outcome, .. } = event {
                let status = match outcome.failure_reason() {
                    None => "ok".to_string(),
                    Some(reason) => format!("FAILED: {reason}"),
                };
                eprintln!(
                    "[{}/{} {:>3.0}%] {} {}",
                    progress.completed,
                    progress.total,
                    progress.fraction() * 100.0,
                    outcome.sku,
                    status
                );
            }
        })
        .await;

    let run = pipeline
        .finalize(&plan, &summary, args.export_failures.as_deref())
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!(
            "sync complete: run_id={} strategy={} updated={} failed={} warnings={} report={}",
            run.run_id,
            run.strategy,
            run.success_count,
            run.failure_count,
            run.warnings,
            run.failure_report.as_deref().unwrap_or("-")
        );
    }
    if let Some(err) = &run.failure_report_error {
        eprintln!("failure report not written: {err}");
    }

    Ok(if run.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
