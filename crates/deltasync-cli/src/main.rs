use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use deltasync_core::{RunStatus, SyncOptions};
use deltasync_store::PgStore;
use deltasync_sync::{engine_from_env, report_markdown, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "deltasync")]
#[command(about = "Incremental sync engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print its summary as JSON.
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Serve the trigger API (and the cron scheduler when enabled).
    Serve,
    /// Print recent run ledger rows.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Render recent run reports as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Wipe entities and fingerprints before running.
    #[arg(long)]
    clear_first: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    all_records: bool,
    #[arg(long)]
    max_records: Option<u64>,
    /// Reprocess every fetched record.
    #[arg(long)]
    force_full_run: bool,
}

impl From<SyncArgs> for SyncOptions {
    fn from(args: SyncArgs) -> Self {
        Self {
            clear_first: args.clear_first,
            dry_run: args.dry_run,
            all_records: args.all_records,
            max_records: args.max_records,
            force_full_run: args.force_full_run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let engine = engine_from_env().await?;
            let summary = engine.run_once(args.into()).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing summary")?
            );
            if summary.status == RunStatus::Failed {
                anyhow::bail!(
                    "sync run {} failed: {}",
                    summary.run_id,
                    summary.error_message.as_deref().unwrap_or("see log output")
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.pg_store_config()?)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            deltasync_web::serve_from_env().await?;
        }
        Commands::Runs { limit } => {
            let engine = engine_from_env().await?;
            let runs = engine.recent_runs(limit).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&runs).context("serializing runs")?
            );
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env()?;
            let root = config
                .reports_root()
                .unwrap_or_else(|| PathBuf::from("reports"));
            println!("{}", report_markdown(runs, &root)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_map_onto_options() {
        let cli = Cli::parse_from(["deltasync", "sync", "--dry-run", "--max-records", "40", "--force-full-run"]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync command");
        };
        let options: SyncOptions = args.into();
        assert!(options.dry_run);
        assert!(options.force_full_run);
        assert!(!options.clear_first);
        assert_eq!(options.max_records, Some(40));
        assert_eq!(options.hard_cap(1000), Some(40));
    }

    #[test]
    fn runs_limit_defaults_to_ten() {
        let cli = Cli::parse_from(["deltasync", "runs"]);
        assert!(matches!(cli.command, Some(Commands::Runs { limit: 10 })));
    }
}
