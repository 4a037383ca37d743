use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use filestream_gateway::config::{GatewayConfig, LiveSettings, StoreSettings};
use filestream_gateway::server::router;
use filestream_gateway::source::http_bridge::HttpBridgeTransport;
use filestream_gateway::store::{MemoryStore, MetadataStore};
use filestream_gateway::StreamingGateway;

/// Serves backend-held files over HTTP with byte-range support
#[derive(Parser, Debug)]
#[command(name = "filestream-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "FILESTREAM_CONFIG",
        default_value = "config/gateway.toml"
    )]
    config: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn load_config(path: &str) -> Result<GatewayConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        info!("loading configuration from {}", path);
        figment = figment.merge(Toml::file(path));
    } else {
        warn!("no config file at {}, using defaults and environment", path);
    }

    figment
        .merge(Env::prefixed("FILESTREAM_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn shutdown_signal(token: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => warn!("failed to listen for ctrl-c: {}", e),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    info!("filestream-gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    for warning in config.validate().context("invalid configuration")? {
        warn!("{}", warning);
    }

    let store: Arc<dyn MetadataStore> = match &config.store.seed_path {
        Some(path) => Arc::new(
            MemoryStore::load_seed(Path::new(path)).context("failed to load metadata seed")?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let transport = Arc::new(
        HttpBridgeTransport::new(&config.backend).context("failed to build bridge transport")?,
    );
    let settings = Arc::new(StoreSettings::new(
        Arc::clone(&store),
        LiveSettings::from_config(&config.streaming),
    ));

    let shutdown = CancellationToken::new();
    let gateway = Arc::new(StreamingGateway::new(
        &config,
        store,
        transport,
        settings,
        shutdown.clone(),
    ));
    let janitor = gateway.spawn_janitor(Duration::from_secs(config.streaming.descriptor_flush_secs));

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!("listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    tokio::spawn(shutdown_signal(signal));

    let serve_token = shutdown.clone();
    axum::serve(listener, router(Arc::clone(&gateway)))
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await
        .context("server error")?;

    gateway.shutdown().await;
    if let Err(e) = janitor.await {
        error!("descriptor cache janitor failed: {}", e);
    }
    info!("stopped");
    Ok(())
}
