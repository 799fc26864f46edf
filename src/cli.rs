use std::path::PathBuf;

use clap::{Parser, Subcommand};
use libp2p::Multiaddr;

/// A tool that detects the peer identities of gateways, pinning services and
/// upload services.
#[derive(Parser, Debug, Clone)]
#[command(name = "antares", version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging.
    #[arg(long, env = "ANTARES_DEBUG", global = true)]
    pub debug: bool,

    /// Log verbosity from 0 (least verbose) to 6 (most verbose).
    /// Overrides --debug.
    #[arg(long = "log-level", env = "ANTARES_LOG_LEVEL", global = true)]
    pub log_level: Option<u8>,

    /// Load configuration from this file.
    #[arg(long, env = "ANTARES_CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Network interface the libp2p host binds to.
    #[arg(long, env = "ANTARES_HOST", global = true)]
    pub host: Option<String>,

    /// Port the libp2p host listens on.
    #[arg(long, env = "ANTARES_PORT", global = true)]
    pub port: Option<u16>,

    /// Interface the prometheus endpoint binds to.
    #[arg(long = "prom-host", env = "ANTARES_PROMETHEUS_HOST", global = true)]
    pub prom_host: Option<String>,

    /// Port of the prometheus metrics endpoint.
    #[arg(long = "prom-port", env = "ANTARES_PROMETHEUS_PORT", global = true)]
    pub prom_port: Option<u16>,

    /// Port of the pprof profiling endpoint.
    #[arg(long = "pprof-port", env = "ANTARES_PPROF_PORT", global = true)]
    pub pprof_port: Option<u16>,

    /// Don't persist anything to a database (no running DB required).
    #[arg(long = "dry-run", env = "ANTARES_DATABASE_DRY_RUN", global = true)]
    pub dry_run: bool,

    /// Host address of the database.
    #[arg(long = "db-host", env = "ANTARES_DATABASE_HOST", global = true)]
    pub db_host: Option<String>,

    /// Port of the database.
    #[arg(long = "db-port", env = "ANTARES_DATABASE_PORT", global = true)]
    pub db_port: Option<u16>,

    /// Name of the database to use.
    #[arg(long = "db-name", env = "ANTARES_DATABASE_NAME", global = true)]
    pub db_name: Option<String>,

    /// Password for the database.
    #[arg(long = "db-password", env = "ANTARES_DATABASE_PASSWORD", global = true)]
    pub db_password: Option<String>,

    /// User to access the database with.
    #[arg(long = "db-user", env = "ANTARES_DATABASE_USER", global = true)]
    pub db_user: Option<String>,

    /// Postgres sslmode to connect with.
    #[arg(long = "db-sslmode", env = "ANTARES_DATABASE_SSL_MODE", global = true)]
    pub db_sslmode: Option<String>,

    /// Comma separated multiaddresses of bootstrap peers.
    #[arg(
        long = "bootstrap-peers",
        env = "ANTARES_BOOTSTRAP_PEERS",
        value_delimiter = ',',
        global = true
    )]
    pub bootstrap_peers: Vec<Multiaddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Provide content to the network and request it through the configured
    /// gateways, pinning services and upload services.
    Start,
}
