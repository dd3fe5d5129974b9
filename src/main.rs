//! Reservoir - A caching forward HTTP/1.1 proxy
//!
//! Binary entry point: configuration, logging, backend selection and the two
//! listeners (proxy and optional stats webserver).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reservoir::api::{create_router, AppState};
use reservoir::cache::{
    system_memory_limit, Cache, CacheStats, DiskCache, MemoryCache, ObjectInfo, SharedCache,
};
use reservoir::config::{CacheType, Config, LogFormat, LoggingConfig};
use reservoir::proxy::{create_proxy_router, ProxyState};

/// Command-line flags. Each one overrides the config file and environment.
#[derive(Debug, Parser)]
#[command(name = "reservoir", version, about)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Proxy listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Cache backend (`memory` or `file`)
    #[arg(long)]
    cache_type: Option<CacheType>,

    /// Directory of the file backend
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Stats webserver listen address
    #[arg(long)]
    webserver_listen: Option<SocketAddr>,

    /// Do not start the stats webserver
    #[arg(long)]
    no_webserver: bool,

    /// Log filter directive, used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Log output (`pretty` or `compact`)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Builds the effective configuration: defaults, file, environment, flags.
    fn load_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env();

        if let Some(listen) = self.listen {
            config.proxy.listen = listen;
        }
        if let Some(cache_type) = self.cache_type {
            config.cache.cache_type = cache_type;
        }
        if let Some(dir) = self.cache_dir {
            config.cache.dir = dir;
        }
        if let Some(listen) = self.webserver_listen {
            config.webserver.listen = listen;
        }
        if self.no_webserver {
            config.webserver.enabled = false;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Main entry point for the Reservoir proxy.
///
/// # Startup Sequence
/// 1. Load configuration (file, environment, flags)
/// 2. Initialize tracing subscriber for logging
/// 3. Open the configured cache backend and start its janitor
/// 4. Start the stats webserver if enabled
/// 5. Serve the proxy until SIGINT/SIGTERM, then destroy the cache
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().load_config()?;
    init_tracing(&config.logging);

    info!("Starting Reservoir caching proxy");
    info!(
        cache_type = ?config.cache.cache_type,
        max_cache_size = config.cache.max_cache_size,
        lock_shards = config.cache.lock_shards,
        janitor_interval_ms = config.cache.janitor_interval_ms,
        "Configuration loaded"
    );

    let stats = Arc::new(CacheStats::new());
    let cache = open_cache(&config, stats.clone()).await?;

    let state = ProxyState::from_config(&config, cache.clone(), stats.clone())
        .context("building upstream client")?;
    let app = create_proxy_router(state);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let webserver = if config.webserver.enabled {
        let listener = tokio::net::TcpListener::bind(config.webserver.listen)
            .await
            .with_context(|| format!("binding stats webserver on {}", config.webserver.listen))?;
        info!("Stats webserver listening on http://{}", config.webserver.listen);

        let router = create_router(AppState::new(stats.clone(), cache.clone()));
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        }))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(config.proxy.listen)
        .await
        .with_context(|| format!("binding proxy on {}", config.proxy.listen))?;
    info!("Proxy listening on http://{}", config.proxy.listen);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    shutdown.cancel();

    if let Some(handle) = webserver {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "stats webserver failed"),
            Err(e) => warn!(error = %e, "stats webserver task panicked"),
        }
    }

    cache.destroy();
    served.context("proxy server failed")?;
    info!("Server shutdown complete");
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());
    let compact = logging.format == LogFormat::Compact;

    tracing_subscriber::registry()
        .with(filter)
        .with((!compact).then(|| tracing_subscriber::fmt::layer().pretty()))
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .init();
}

/// Opens the configured backend and starts its janitor.
async fn open_cache(config: &Config, stats: Arc<CacheStats>) -> anyhow::Result<SharedCache> {
    let settings = &config.cache;
    let cache = match settings.cache_type {
        CacheType::Memory => {
            let limit = system_memory_limit(settings.memory_limit_percent);
            let cache = Arc::new(MemoryCache::<ObjectInfo>::new(
                limit,
                settings.lock_shards,
                stats,
            ));
            cache.start_janitor(settings.janitor());
            info!(memory_limit = limit, "In-memory cache initialized");
            cache as SharedCache
        }
        CacheType::File => {
            let cache = DiskCache::<ObjectInfo>::open(&settings.dir, settings.lock_shards, stats)
                .await
                .with_context(|| format!("opening cache directory {}", settings.dir.display()))?;
            let cache = Arc::new(cache);
            cache.start_janitor(settings.janitor());
            info!(
                dir = %settings.dir.display(),
                entries = cache.len(),
                "File cache initialized"
            );
            cache as SharedCache
        }
    };
    Ok(cache)
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM), then cancels `token`.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    token.cancel();
}
