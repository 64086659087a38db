//! proxyfleet - Main entry point
//!
//! Reconciles the proxy fleet on boot, then serves the management API until
//! interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use proxyfleet::config::{
    DEFAULT_HEALTH_CHECK_PATH, DEFAULT_MANAGEMENT_PORT, DEFAULT_USABLE_PORT_START,
};
use proxyfleet::{
    AssetDirectory, CertificateManager, ConfigStore, DisabledDirectory, FleetSettings,
    HttpAssetDirectory, ManagementServer, ProxyOrchestrator, SqliteAssetDirectory, Transport,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// proxyfleet - per-device reverse proxy orchestrator
#[derive(Parser, Debug)]
#[command(name = "proxyfleet")]
#[command(version = "1.0.0")]
#[command(about = "Orchestrates a fleet of per-device reverse proxies")]
struct Args {
    /// Management API port; defaults to SERVER.PORT of the config document
    #[arg(long, env = "MANAGEMENT_PORT")]
    management_port: Option<u16>,

    /// First port probed when a requested proxy port is taken
    #[arg(long, env = "USABLE_PORT_START", default_value_t = DEFAULT_USABLE_PORT_START)]
    usable_port_start: u16,

    /// Address proxy listeners and the management API bind to
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    listen_host: IpAddr,

    /// Proxy config document
    #[arg(long, env = "PROXY_CONFIG", default_value = "./config/proxy_config.json")]
    config: PathBuf,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// SQL RPC endpoint of the asset database
    #[arg(long, env = "ASSET_DB_URL")]
    asset_db_url: Option<String>,

    /// Database name sent with every SQL RPC call
    #[arg(long, env = "ASSET_DB_NAME", default_value = "tmsplus")]
    asset_db_name: String,

    /// Local SQLite asset database, used instead of the RPC endpoint
    #[arg(long, env = "ASSET_DB_PATH", conflicts_with = "asset_db_url")]
    asset_db_path: Option<PathBuf>,

    /// Serve plain HTTP on proxy listeners and the management port
    #[arg(long, env = "DISABLE_TLS", default_value = "false")]
    disable_tls: bool,

    /// Path probed by the health check
    #[arg(long, env = "HEALTH_CHECK_PATH", default_value = DEFAULT_HEALTH_CHECK_PATH)]
    health_check_path: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting proxyfleet v1.0.0");

    let management_port = match args.management_port {
        Some(port) => port,
        None => ConfigStore::new(&args.config, DEFAULT_MANAGEMENT_PORT)
            .document()
            .context("Failed to read proxy config")?
            .server
            .port
            .unwrap_or(DEFAULT_MANAGEMENT_PORT),
    };
    info!("Management port: {}", management_port);

    let tls = if args.disable_tls {
        warn!("TLS disabled; proxies and management API serve plain HTTP");
        None
    } else {
        let cert_manager = CertificateManager::new(&args.certs_dir)?;
        info!("Certificate manager initialized at: {}", args.certs_dir.display());
        Some(cert_manager.acceptor()?)
    };

    let directory: Arc<dyn AssetDirectory> = match (&args.asset_db_path, &args.asset_db_url) {
        (Some(path), _) => {
            info!("Asset database: sqlite {}", path.display());
            Arc::new(SqliteAssetDirectory::new(path)?)
        }
        (None, Some(url)) => {
            info!("Asset database: {} ({})", url, args.asset_db_name);
            Arc::new(HttpAssetDirectory::new(url.as_str(), args.asset_db_name.as_str())?)
        }
        (None, None) => {
            warn!("No asset database configured; using the config file only");
            Arc::new(DisabledDirectory)
        }
    };

    let settings = FleetSettings {
        management_port,
        usable_port_start: args.usable_port_start,
        listen_host: args.listen_host,
        health_check_path: args.health_check_path,
    };
    let store = ConfigStore::new(&args.config, management_port);
    let transport = Arc::new(Transport::new(tls.clone())?);
    let orchestrator = Arc::new(ProxyOrchestrator::new(settings, store, directory, transport)?);

    let report = orchestrator
        .startup_reconcile()
        .await
        .context("Startup reconciliation failed")?;
    let failed = report.results.iter().filter(|r| !r.result).count();
    info!(
        "Reconciled {} proxies from {:?} ({} failed)",
        report.results.len(),
        report.source,
        failed
    );

    let server = Arc::new(ManagementServer::new(orchestrator.clone(), tls));
    let addr = SocketAddr::new(args.listen_host, management_port);

    tokio::select! {
        result = server.run(addr) => {
            if let Err(e) = &result {
                error!("Management server stopped: {}", e);
            }
            orchestrator.shutdown().await;
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            orchestrator.shutdown().await;
        }
    }

    Ok(())
}
