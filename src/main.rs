//! member-sync - Background synchronization of group memberships
//!
//! This is the main entry point for the member-sync application.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use member_sync::config::Config;
use member_sync::database::{Database, SqliteDatabase};
use member_sync::otel::{init_tracing, OtelProvider, SyncMetrics};
use member_sync::sync::UpdateDriver;
use member_sync::upstream::HttpConnector;

/// member-sync - Background synchronization of group memberships
#[derive(Parser, Debug)]
#[command(name = "member-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "MEMBER_SYNC_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the update driver until interrupted
    Run,

    /// Record one job per group for a user and print the job ids
    Enqueue {
        /// User whose credential is used for the upstream calls
        #[arg(long)]
        user_id: i64,

        /// Groups to resynchronize
        #[arg(long = "group-id", required = true, num_args = 1..)]
        group_ids: Vec<i64>,
    },

    /// Print jobs as JSON
    Jobs {
        /// Job ids
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Store an access token for a user
    AddToken {
        #[arg(long)]
        user_id: i64,

        #[arg(long, env = "MEMBER_SYNC_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize OpenTelemetry provider
    let otel_provider = OtelProvider::new(&config.otel)?;

    // Initialize tracing/logging
    init_tracing(&otel_provider, &config.logging)?;

    // Initialize database
    let database = Arc::new(
        SqliteDatabase::new(&config.database.path)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.path))?,
    );

    let result = match args.command {
        Command::Run => run(config, database, &otel_provider).await,
        Command::Enqueue { user_id, group_ids } => {
            let request_id = Uuid::new_v4();
            let ids = database.insert_jobs(request_id, user_id, &group_ids).await?;
            info!(%request_id, user_id, jobs = ids.len(), "Jobs enqueued");
            for id in ids {
                println!("{}", id);
            }
            Ok(())
        }
        Command::Jobs { ids } => {
            let jobs = database.list_jobs_by_ids(&ids).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Command::AddToken {
            user_id,
            access_token,
        } => {
            let id = database.insert_access_token(user_id, &access_token).await?;
            info!(token_id = id, user_id, "Access token stored");
            Ok(())
        }
    };

    // Shutdown OpenTelemetry
    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    result
}

/// Run the update driver until a shutdown signal
async fn run(
    config: Config,
    database: Arc<SqliteDatabase>,
    otel_provider: &OtelProvider,
) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %config.database.path,
        "Starting member-sync"
    );

    let connector = Arc::new(HttpConnector::new(config.upstream.clone())?);
    let metrics = SyncMetrics::new(&otel_provider.meter());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let driver = UpdateDriver::new(
        database,
        connector,
        config.driver,
        config.retry,
        config.upstream,
        metrics,
        shutdown_rx,
    );
    let handle = tokio::spawn(driver.run());

    shutdown_signal().await;
    let _ = shutdown_tx.send(());
    handle.await.context("Update driver task failed")?;

    info!("member-sync shutdown complete");
    Ok(())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let config = match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path)
        }
        None => {
            eprintln!("Loading configuration from environment variables");
            Config::from_env()
        }
    }
    .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
    Ok(config)
}

/// Create a future that resolves when a shutdown signal is received
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
