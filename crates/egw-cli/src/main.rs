use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use egw_sync::{AppConfig, GameStore, Services};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "egw-cli")]
#[command(about = "Encounter game watch: scrape, reconcile and notify")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations and exit.
    Migrate,
    /// Scrape both listing views once and merge every record.
    Ingest,
    /// Compare the store with the live views and resolve vanished games.
    ReconcileActive,
    /// Re-evaluate lifecycle states against the current time.
    Sweep,
    /// Send due broadcasts and subscriber notices.
    Notify,
    /// Run a bot command as the given chat user and print the replies.
    Chat {
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value = "anonymous")]
        nickname: String,
        /// Command text, e.g. "/subscribe 42".
        text: Vec<String>,
    },
    /// Start every periodic job and run until Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            let store = GameStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Ingest => {
            let services = Services::from_config(&config).await?;
            let summary = egw_sync::run_ingestion(&services, Utc::now()).await?;
            println!(
                "ingest complete: run_id={} records={} created={} updated={} unchanged={} failed_targets={}",
                summary.run_id,
                summary.records,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.failed_targets
            );
        }
        Commands::ReconcileActive => {
            let services = Services::from_config(&config).await?;
            let report = egw_sync::run_active_set(&services).await?;
            println!(
                "active-set pass: completed={:?} promoted={:?} archived={:?}",
                report.completed, report.promoted, report.archived
            );
        }
        Commands::Sweep => {
            let services = Services::from_config(&config).await?;
            let report = egw_sync::run_sweep(&services, Utc::now()).await?;
            println!(
                "sweep: examined={} transitions={}",
                report.examined,
                report.transitions.len()
            );
        }
        Commands::Notify => {
            let services = Services::from_config(&config).await?;
            let report = egw_sync::run_dispatch(&services, Utc::now()).await?;
            println!(
                "notify: announcements={} start_notices={} subscriber_notices={} blocked={} failed={}",
                report.announcements,
                report.start_notices,
                report.subscriber_notices,
                report.blocked,
                report.failed
            );
        }
        Commands::Chat {
            user_id,
            nickname,
            text,
        } => {
            let services = Services::from_config(&config).await?;
            let reply = services
                .commands
                .handle_text(user_id, &nickname, &text.join(" "))
                .await?;
            for message in reply.messages {
                println!("{message}\n");
            }
        }
        Commands::Run => {
            let services = Arc::new(Services::from_config(&config).await?);
            let Some(mut sched) = egw_sync::maybe_build_scheduler(services, &config).await? else {
                println!("scheduler disabled (EGW_SCHEDULER_ENABLED=false); nothing to run");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
