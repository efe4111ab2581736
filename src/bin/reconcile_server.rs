//! Contact reconciliation server.
//!
//! `reconcile-server serve` runs the HTTP API over a persistent contact
//! database; `reconcile-server seed` loads the demo contacts into one.
//! Settings come from `RECONCILE_*` environment variables (and `.env`);
//! command-line flags win over both.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use contact_reconcile::config::{EngineConfig, ServerConfig};
use contact_reconcile::engine::runtime::{ReconcileRuntime, ReconcileRuntimeConfig};
use contact_reconcile::seed::seed_demo_contacts;
use contact_reconcile::storage::{
    open_database, ContactStore, PersistentConfig, PersistentContactStore,
};
use contact_reconcile::transport::{self, AppState};
use contact_reconcile::ReconcileEngine;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "reconcile-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the identify API
    Serve(ServeArgs),
    /// Load the demo contacts into an empty database
    Seed(DataArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, short = 'l')]
    listen: Option<SocketAddr>,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(Args)]
struct DataArgs {
    /// Database directory
    #[arg(long, short = 'd')]
    data_dir: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,contact_reconcile=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store(config: &ServerConfig) -> Result<PersistentContactStore, BoxError> {
    let store = open_database(
        &config.data_dir,
        Some(PersistentConfig {
            max_wal_size: config.max_wal_bytes,
            sync_on_write: config.sync_on_write,
        }),
    )?;
    tracing::info!(
        dir = %config.data_dir.display(),
        sequence = store.sequence()?,
        "opened contact database"
    );
    Ok(store)
}

fn compact_if_needed(store: &PersistentContactStore) -> Result<(), BoxError> {
    if store.needs_compaction()? {
        let result = store.compact()?;
        tracing::info!(
            before = result.wal_size_before,
            after = result.wal_size_after,
            "WAL compacted"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown requested");
}

async fn serve(config: ServerConfig) -> Result<(), BoxError> {
    let store = Arc::new(open_store(&config)?);
    compact_if_needed(&store)?;

    let engine = ReconcileEngine::with_config(
        Arc::clone(&store) as Arc<dyn ContactStore>,
        EngineConfig {
            retry: config.retry.clone(),
        },
    );
    let runtime = ReconcileRuntime::new(
        engine,
        &ReconcileRuntimeConfig {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
        },
    )?;
    let state = AppState::new(Arc::new(runtime), config.request_timeout);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    transport::serve(listener, state, shutdown_signal()).await?;

    compact_if_needed(&store)?;
    tracing::info!("shut down");
    Ok(())
}

fn seed(config: &ServerConfig) -> Result<(), BoxError> {
    let store = open_store(config)?;
    let created = seed_demo_contacts(&store)?;
    if created == 0 {
        println!("Database already holds contacts; nothing seeded");
    } else {
        println!("Seeded {created} demo contacts into {}", config.data_dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env()?;

    match cli.command {
        Command::Serve(args) => {
            if let Some(listen) = args.listen {
                config.listen_addr = listen;
            }
            if let Some(dir) = args.data.data_dir {
                config.data_dir = dir;
            }
            serve(config).await
        }
        Command::Seed(args) => {
            if let Some(dir) = args.data_dir {
                config.data_dir = dir;
            }
            seed(&config)
        }
    }
}
