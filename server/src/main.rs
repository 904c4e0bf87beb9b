// Cowrite hub - main entry point
//
// Bootstrap, CLI commands, and shutdown orchestration only; routing,
// handlers, and the realtime plane live in the library modules.

pub use cowrite_server::*;

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cowrite_core::HubConfig;
use cowrite_core::cache::{MemoryCache, SharedCache};
use cowrite_core::ids::PrincipalId;
use cowrite_core::queue::PersistenceQueue;
use cowrite_server::auth::AccessTokenSigner;
use cowrite_server::worker::QueueWorker;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cowrite realtime collaboration hub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the hub (HTTP + realtime gateway + queue worker)
    Serve,
    /// Mint a development bearer token with the process signing key
    SignToken {
        /// Principal id the token asserts
        #[arg(long)]
        principal: String,
        /// Display name shown to collaborators
        #[arg(long)]
        name: String,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: u64,
    },
    /// Print queue statistics for the local (in-process) store layout
    QueueStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv();
    observability::init_tracing();

    let cli = Cli::parse();
    let config = HubConfig::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::SignToken {
            principal,
            name,
            ttl_secs,
        } => run_sign_token(principal, name, ttl_secs),
        Command::QueueStats => run_queue_stats(config).await,
    }
}

async fn run_serve(config: HubConfig) -> anyhow::Result<()> {
    info!(
        bind_address = %config.bind_address,
        document_backend = ?config.document_backend,
        session_ttl_secs = config.session_ttl_secs,
        queue_tick_ms = config.queue_tick_ms,
        "starting cowrite hub"
    );

    let bind_address = config.bind_address;
    let state = build_state(config);

    let worker = QueueWorker::new(
        state.queue.clone(),
        state.documents.clone(),
        state.content.clone(),
        state.config.queue_tick(),
        state.config.job_timeout(),
    )
    .start();

    let app = router::build_router(state.clone());

    let listener = TcpListener::bind(bind_address)
        .await
        .context("failed to bind socket")?;
    let actual_addr = listener
        .local_addr()
        .context("failed to read local address")?;
    info!("listening on {actual_addr}");

    let shutdown_state = state.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_state.drain().await;
        worker.stop().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(?err, "server terminated with error");
    }

    Ok(())
}

fn run_sign_token(principal: String, name: String, ttl_secs: u64) -> anyhow::Result<()> {
    let principal = principal.trim().to_owned();
    anyhow::ensure!(!principal.is_empty(), "principal must not be empty");
    anyhow::ensure!(!name.trim().is_empty(), "name must not be empty");

    let signer = AccessTokenSigner::new();
    let token = signer.mint(
        &PrincipalId::from(principal),
        name.trim(),
        Duration::from_secs(ttl_secs),
    );
    println!("{token}");
    Ok(())
}

async fn run_queue_stats(config: HubConfig) -> anyhow::Result<()> {
    // With the in-process cache backend a fresh store is necessarily empty;
    // the command exists for parity and as a layout smoke test.
    let cache: SharedCache = Arc::new(MemoryCache::new());
    let queue = PersistenceQueue::new(
        cache,
        config.queue_max_attempts,
        config.queue_backoff(),
    );
    let stats = queue.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
