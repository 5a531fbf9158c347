use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prisguide_core::{Category, ExecutionResult, ExecutionType};
use prisguide_storage::PgStore;
use prisguide_sync::{Pipeline, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "prisguide")]
#[command(about = "Provider acquisition pipeline for Norwegian price comparison")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and reconcile one category.
    Run { category: String },
    /// Run every category in order.
    RunAll,
    /// Apply database migrations.
    Migrate,
    /// Register endpoints from a pipe-delimited provider file.
    Seed { file: PathBuf },
    /// Register endpoints from a YAML manifest.
    Import { manifest: PathBuf },
    /// Serve the HTTP trigger surface.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::RunAll) {
        Commands::Run { category } => {
            let category: Category = category.parse()?;
            let pipeline = pipeline().await?;
            let cancel = cancel_on_ctrl_c();
            let result = pipeline
                .run_category_with(category, ExecutionType::Manual, &cancel)
                .await;
            print_result(&result);
            if !result.success {
                bail!("{category} run failed");
            }
        }
        Commands::RunAll => {
            let pipeline = pipeline().await?;
            let cancel = cancel_on_ctrl_c();
            let summary = pipeline.run_all_with(ExecutionType::Manual, &cancel).await;
            for result in &summary.results {
                print_result(result);
            }
            println!(
                "batch complete: run_id={} categories={}/{} fetched={} saved={} duplicates={} fallback={}",
                summary.run_id,
                summary.successful_categories,
                summary.results.len(),
                summary.total_fetched,
                summary.total_saved,
                summary.total_duplicates,
                summary.fallback_categories
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Seed { file } => {
            let pipeline = pipeline().await?;
            let log = pipeline
                .registry()
                .register_provider_file(&file)
                .await
                .with_context(|| format!("seeding from {}", file.display()))?;
            print_import(&log);
        }
        Commands::Import { manifest } => {
            let pipeline = pipeline().await?;
            let log = pipeline
                .registry()
                .register_manifest(&manifest)
                .await
                .with_context(|| format!("importing {}", manifest.display()))?;
            print_import(&log);
        }
        Commands::Serve => prisguide_web::serve_from_env().await?,
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("prisguide=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("PRISGUIDE_LOG_JSON").is_ok_and(|v| v == "1") {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn pipeline() -> Result<Pipeline> {
    Ok(prisguide_sync::pipeline_from_env().await?.1)
}

/// First Ctrl-C cancels the run between attempts and pauses.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            trigger.cancel();
        }
    });
    cancel
}

fn print_result(result: &ExecutionResult) {
    println!(
        "{}: success={} fetched={} saved={} duplicates={} failed={} attempts={} retried={} fallback={} elapsed_ms={}",
        result.category,
        result.success,
        result.providers_fetched,
        result.providers_saved,
        result.duplicates_found,
        result.failed_records,
        result.attempts,
        result.retried_count,
        result.used_fallback,
        result.execution_time_ms
    );
    if let Some(error) = &result.error {
        println!("  error: {error}");
    }
    if result.synthetic {
        println!("  degraded: {} seed provider(s) returned, none saved", result.providers.len());
    }
}

fn print_import(log: &prisguide_core::ImportLogEntry) {
    println!(
        "import complete: source={} registered={} already_present={} skipped={}",
        log.source, log.registered, log.already_present, log.skipped
    );
    for error in &log.errors {
        println!("  {error}");
    }
}
