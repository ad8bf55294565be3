mod client;
mod config;
mod render;
mod runs;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use crate::client::{ApiClient, ClientError, HttpApiClient};
use crate::config::Config;
use crate::runs::model::RunStatus;
use crate::runs::watch::{RunWatcher, WatchConfig, WatchUpdate};

#[derive(Parser)]
#[command(name = "runwatch", about = "Terminal monitor for automation backend runs")]
struct Cli {
    /// Backend base URL (overrides RUNWATCH_BACKEND_URL and the config file)
    #[arg(long, global = true)]
    backend: Option<String>,
    /// Path to a runwatch.toml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Follow a run until it reaches a terminal status
    Watch {
        run_id: String,
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List recent runs
    Runs,
    /// List runs with requester metadata and aggregate stats
    Admin {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Resolve a checkout session to a run id
    Lookup {
        session_id: String,
        /// Keep polling until the backend has created the mapping
        #[arg(long)]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("runwatch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref(), cli.backend)?;
    let client: Arc<dyn ApiClient> = Arc::new(HttpApiClient::new(&config)?);

    match cli.command {
        Command::Watch { run_id, interval } => {
            let interval = Duration::from_secs(interval.unwrap_or(config.poll_interval));
            watch_run(client, &run_id, interval).await
        }
        Command::Runs => {
            let runs = client.list_runs().await.context("failed to list runs")?;
            if runs.is_empty() {
                println!("no runs recorded");
            } else {
                print!("{}", render::runs_table(&runs));
            }
            Ok(())
        }
        Command::Admin { limit } => {
            let runs = client
                .admin_runs(limit)
                .await
                .context("failed to fetch admin runs")?;
            print!("{}", render::admin_table(&runs));
            println!("{}", render::stats_line(&render::admin_stats(&runs)));
            Ok(())
        }
        Command::Lookup { session_id, wait } => {
            lookup_session(client, &session_id, wait, config.poll_interval).await
        }
    }
}

async fn watch_run(client: Arc<dyn ApiClient>, run_id: &str, interval: Duration) -> Result<()> {
    let watcher = RunWatcher::new(client, WatchConfig { interval });
    let mut handle = watcher.spawn(run_id);
    let mut printer = render::StepPrinter::new();
    let mut header_printed = false;

    while let Some(update) = handle.changed().await {
        match update {
            WatchUpdate::Loading => {}
            WatchUpdate::NotFound => bail!("run {run_id} not found"),
            WatchUpdate::Snapshot(view) => {
                if !header_printed {
                    println!("{}", render::run_header(&view.run));
                    header_printed = true;
                }
                for line in printer.announce(&view.steps) {
                    println!("{line}");
                }
                if view.run.status.is_terminal() {
                    println!("{}", render::final_summary(&view));
                    if matches!(view.run.status, RunStatus::Failed | RunStatus::Error) {
                        bail!("run {run_id} ended with status {}", view.run.status);
                    }
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

async fn lookup_session(
    client: Arc<dyn ApiClient>,
    session_id: &str,
    wait: bool,
    poll_interval: u64,
) -> Result<()> {
    loop {
        match client.lookup_run(session_id).await {
            Ok(run_id) => {
                println!("{run_id}");
                return Ok(());
            }
            Err(ClientError::NotFound) if wait => {
                tracing::info!(session_id = %session_id, "no run mapped yet, retrying");
                tokio::time::sleep(Duration::from_secs(poll_interval)).await;
            }
            Err(ClientError::NotFound) => {
                bail!("no run mapped to session {session_id} yet");
            }
            Err(e) => return Err(e).context("lookup failed"),
        }
    }
}
