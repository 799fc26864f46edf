use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use antares::cli::{Cli, Command};
use antares::config::{self, Config};
use antares::db::{self, PeerStore};
use antares::geo::GeoClient;
use antares::metrics::{self, Metrics};
use antares::pprof;
use antares::scheduler::Scheduler;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command.clone() {
        Command::Start => start(cli).await,
    }
}

/// Starts the libp2p host that provides content to the network and requests
/// it back through the configured gateways, pinning and upload services.
async fn start(cli: Cli) -> Result<()> {
    info!("Starting Antares...");

    let mut config = Config::load(cli.config.clone()).context("init configuration")?;
    config.apply(&cli);

    let mut registry = Registry::default();
    let metrics = Metrics::new(&mut registry);

    let prom_addr: SocketAddr = format!("{}:{}", config.prometheus.host, config.prometheus.port)
        .parse()
        .context("prometheus listen address")?;
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(registry, prom_addr).await {
            error!("metrics endpoint failed: {err:#}");
        }
    });

    let pprof_addr: SocketAddr = format!("0.0.0.0:{}", config.pprof_port)
        .parse()
        .context("pprof listen address")?;
    tokio::spawn(async move {
        if let Err(err) = pprof::serve(pprof_addr).await {
            warn!("profiling endpoint failed: {err:#}");
        }
    });

    let db: Option<Arc<dyn PeerStore>> = if config.database.dry_run {
        None
    } else {
        Some(Arc::new(db::Client::connect(&config.database).await?))
    };

    let geo = Arc::new(GeoClient::open(&config::data_root()?));

    let scheduler =
        Scheduler::new(config, db, geo, metrics).context("creating new scheduler")?;
    info!(peer_id = %scheduler.local_peer_id(), "host identity loaded");

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    scheduler.run(token).await
}

/// Cancels the root token on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                warn!("failed to listen for ctrl-c: {err}");
            }
        }
        _ = terminate => {}
    }

    info!("Received interrupt signal - Stopping...");
    token.cancel();
}

/// Maps --debug / --log-level onto a tracing filter; RUST_LOG wins when set.
fn init_tracing(cli: &Cli) {
    let level = match cli.log_level {
        Some(0..=2) => "error",
        Some(3) => "warn",
        Some(5) => "debug",
        Some(level) if level >= 6 => "trace",
        Some(_) => "info",
        None if cli.debug => "debug",
        None => "info",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("antares={level},warn")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
