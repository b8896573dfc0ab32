use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{StoreBackend, WardenConfig};
use ratewarden::http::{router, HttpServer, RouterSettings};
use ratewarden::ratelimit::{
    Clock, MemoryStore, RateLimiter, RedisStore, SystemClock, TatStore,
};

/// How often the in-process store drops expired keys.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Distributed GCRA admission control.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs regardless of environment
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = WardenConfig::load(args.config.as_deref()).context("failed to load config")?;
    init_tracing(&config, &args);

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        environment = %config.server.environment,
        backend = ?config.rate_limiting.backend,
        failure_policy = ?config.rate_limiting.failure_policy,
        "Configuration loaded"
    );

    let store = connect_store(&config).await?;
    let rate_limiter = Arc::new(RateLimiter::from_config(store, &config.rate_limiting));
    info!(
        burst = config.rate_limiting.burst,
        rate_per_second = config.rate_limiting.rate_per_second,
        "Rate limiter initialized"
    );

    let app = router(rate_limiter, &RouterSettings::from_config(&config));
    let server = HttpServer::new(
        config.server.http_addr,
        app,
        config.server.shutdown_timeout(),
    );

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratewarden stopped");
    Ok(())
}

fn init_tracing(config: &WardenConfig, args: &Args) {
    let default_level = match args.log_level.as_deref() {
        Some(level) => level,
        None if config.server.is_production() => "info",
        None => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if args.json_logs || config.server.is_production() {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_store(config: &WardenConfig) -> anyhow::Result<Arc<dyn TatStore>> {
    match config.rate_limiting.backend {
        StoreBackend::Redis => {
            let store: Arc<dyn TatStore> = Arc::new(
                RedisStore::connect(&config.redis)
                    .await
                    .context("failed to connect to redis")?,
            );
            Ok(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-process store; limits are not shared between processes");
            let memory = Arc::new(MemoryStore::new());
            spawn_memory_purge(memory.clone());
            let store: Arc<dyn TatStore> = memory;
            Ok(store)
        }
    }
}

fn spawn_memory_purge(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired(SystemClock.now_nanos());
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
