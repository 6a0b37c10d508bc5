use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use turnstile::config::{StoreBackend, StoreConfig, TurnstileConfig};
use turnstile::http::{AppState, HeaderIdentityResolver, HttpServer};
use turnstile::ratelimit::{PolicySeedFile, RateLimiter};
use turnstile::store::{CounterStore, MemoryStore};

/// HTTP admission gate with per-identity rate limiting.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the store backend
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Override the Redis URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting Turnstile admission gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    if let Some(url) = cli.redis_url {
        config.store.redis_url = url;
    }
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        window_secs = config.rate_limiting.window_secs,
        block_secs = config.rate_limiting.block_secs,
        max_requests_by_address = config.rate_limiting.max_requests_by_address,
        max_requests_by_credential = config.rate_limiting.max_requests_by_credential,
        on_store_error = ?config.rate_limiting.on_store_error,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let limiter = Arc::new(RateLimiter::new(store.clone(), config.rate_limiting.defaults()));

    if let Some(path) = &config.rate_limiting.seed_path {
        let seeds = PolicySeedFile::from_file(path)?;
        limiter.policies().apply_seeds(&seeds.policies).await?;
    }

    spawn_maintenance(limiter.clone(), store, config.rate_limiting.maintenance_interval());

    let resolver = HeaderIdentityResolver::new(
        &config.server.credential_header,
        config.server.trust_forwarded_for,
    )?;
    let state = Arc::new(AppState {
        limiter,
        resolver: Arc::new(resolver),
        on_store_error: config.rate_limiting.on_store_error,
    });

    HttpServer::new(config.server.http_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile admission gate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            use turnstile::store::{RedisStore, RedisStoreConfig};

            let store = RedisStore::connect_with_config(
                &config.redis_url,
                RedisStoreConfig {
                    key_prefix: config.key_prefix.clone(),
                },
            )
            .await?;
            store.ping().await?;
            info!(url = %config.redis_url, "Connected to Redis successfully");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => anyhow::bail!("built without the redis-store feature"),
    }
}

/// Periodically drop idle identity locks and expired store entries.
fn spawn_maintenance(
    limiter: Arc<RateLimiter>,
    store: Arc<dyn CounterStore>,
    every: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            limiter.prune_idle_locks();
            if let Err(e) = store.purge_expired().await {
                warn!(error = %e, "Failed to purge expired entries");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
