use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::Cli;

/// File name of the configuration inside the antares config directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Environment variable overriding the config directory.
pub const ENV_CONFIG_DIR: &str = "ANTARES_CONFIG_DIR";

// The default IPFS bootstrap set.
// Based on https://github.com/ipfs/go-ipfs-config/blob/master/bootstrap_peers.go#L17.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ", // mars.i.ipfs.io
];

/// General user configuration, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The path the configuration was loaded from.
    #[serde(skip)]
    pub path: PathBuf,

    /// Whether the file already existed when antares started.
    #[serde(skip)]
    pub existed: bool,

    /// IPv4 interface the libp2p host binds to.
    pub host: String,

    /// Port the libp2p host listens on (TCP and QUIC).
    pub port: u16,

    pub prometheus: PrometheusConfig,

    /// Port of the profiling endpoint. Not persisted; set via CLI.
    #[serde(skip)]
    pub pprof_port: u16,

    pub database: DatabaseConfig,

    /// Protobuf-encoded Ed25519 private key. Generated and written back on
    /// first run; peer identity must be stable across restarts because
    /// service-side reputation and rate limits key on the peer id.
    #[serde(with = "hex_bytes")]
    pub private_key_raw: Vec<u8>,

    pub pinning_services: Vec<PinningServiceConfig>,

    pub gateways: Vec<GatewayConfig>,

    pub upload_services: Vec<UploadServiceConfig>,

    /// Bootstrap peers. Not persisted; defaults or CLI.
    #[serde(skip)]
    pub bootstrap_peers: Vec<Multiaddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrometheusConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Skip the database entirely and log tracked peers instead.
    pub dry_run: bool,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub password: String,
    pub user: String,
    /// One of the libpq sslmode values.
    pub ssl_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinningServiceConfig {
    pub target: String,
    pub authorization: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub name: String,
    /// URL template containing the `{cid}` token.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadServiceConfig {
    pub target: String,
    pub authorization: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: PathBuf::new(),
            existed: false,
            host: "0.0.0.0".to_string(),
            port: 2002,
            prometheus: PrometheusConfig::default(),
            pprof_port: 2003,
            database: DatabaseConfig::default(),
            private_key_raw: Vec::new(),
            pinning_services: Vec::new(),
            gateways: Vec::new(),
            upload_services: Vec::new(),
            bootstrap_peers: default_bootstrap_peers(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        PrometheusConfig {
            host: "0.0.0.0".to_string(),
            port: 2004,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            dry_run: false,
            host: "0.0.0.0".to_string(),
            port: 5432,
            name: "antares".to_string(),
            password: "password".to_string(),
            user: "antares".to_string(),
            ssl_mode: "disable".to_string(),
        }
    }
}

impl Config {
    /// Reads the configuration from the given path, falling back to the
    /// XDG-compliant default location. The file is created on first run; a
    /// missing private key is generated and written back.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => config_root()?.join(CONFIG_FILE_NAME),
        };
        info!("loading configuration from {}", path.display());

        let mut conf = if path.exists() {
            let data = fs::read(&path)
                .with_context(|| format!("read config at {}", path.display()))?;
            let mut conf: Config =
                serde_json::from_slice(&data).context("unmarshal configuration")?;
            conf.existed = true;
            conf.bootstrap_peers = default_bootstrap_peers();
            conf
        } else {
            Config::default()
        };
        conf.path = path;

        if conf.private_key_raw.is_empty() {
            info!("generating new peer identity");
            let keypair = Keypair::generate_ed25519();
            conf.private_key_raw = keypair
                .to_protobuf_encoding()
                .context("encode private key")?;
            conf.save()?;
        } else if !conf.existed {
            conf.save()?;
        }

        Ok(conf)
    }

    /// Persists the configuration to its path.
    pub fn save(&self) -> Result<()> {
        info!("saving configuration file to {}", self.path.display());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(self).context("marshal configuration")?;
        fs::write(&self.path, data)
            .with_context(|| format!("write config at {}", self.path.display()))
    }

    /// Overwrites file configuration with command line arguments.
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(host) = &cli.prom_host {
            self.prometheus.host = host.clone();
        }
        if let Some(port) = cli.prom_port {
            self.prometheus.port = port;
        }
        if let Some(port) = cli.pprof_port {
            self.pprof_port = port;
        }
        if cli.dry_run {
            self.database.dry_run = true;
        }
        if let Some(host) = &cli.db_host {
            self.database.host = host.clone();
        }
        if let Some(port) = cli.db_port {
            self.database.port = port;
        }
        if let Some(name) = &cli.db_name {
            self.database.name = name.clone();
        }
        if let Some(password) = &cli.db_password {
            self.database.password = password.clone();
        }
        if let Some(user) = &cli.db_user {
            self.database.user = user.clone();
        }
        if let Some(ssl_mode) = &cli.db_sslmode {
            self.database.ssl_mode = ssl_mode.clone();
        }
        if !cli.bootstrap_peers.is_empty() {
            self.bootstrap_peers = cli.bootstrap_peers.clone();
        }
    }

    /// The persisted host identity.
    pub fn keypair(&self) -> Result<Keypair> {
        Keypair::from_protobuf_encoding(&self.private_key_raw).context("unmarshal private key")
    }

    /// Listen addresses for the libp2p host: TCP and QUIC over IPv4.
    pub fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let tcp = format!("/ip4/{}/tcp/{}", self.host, self.port)
            .parse()
            .context("construct IPv4 TCP address")?;
        let quic = format!("/ip4/{}/udp/{}/quic-v1", self.host, self.port)
            .parse()
            .context("construct IPv4 QUIC address")?;
        Ok(vec![tcp, quic])
    }
}

/// The antares config directory: `$ANTARES_CONFIG_DIR`, or the platform
/// config dir joined with `antares`.
pub fn config_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for configuration"))?;
    Ok(cfg.join("antares"))
}

/// The antares data directory, where the GeoIP databases live.
pub fn data_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os("ANTARES_DATA_DIR") {
        return Ok(PathBuf::from(val));
    }
    let data = dirs_next::data_dir()
        .ok_or_else(|| anyhow!("operating environment provides no directory for application data"))?;
    Ok(data.join("antares"))
}

fn default_bootstrap_peers() -> Vec<Multiaddr> {
    DEFAULT_BOOTSTRAP
        .iter()
        .map(|node| node.parse().expect("valid bootstrap multiaddr"))
        .collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_creates_file_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let conf = Config::load(Some(path.clone())).unwrap();
        assert!(path.exists());
        assert!(!conf.existed);
        assert!(!conf.private_key_raw.is_empty());
        conf.keypair().unwrap();

        // a second load round-trips the identity
        let reloaded = Config::load(Some(path)).unwrap();
        assert!(reloaded.existed);
        assert_eq!(reloaded.private_key_raw, conf.private_key_raw);
        assert_eq!(
            reloaded.keypair().unwrap().public(),
            conf.keypair().unwrap().public()
        );
    }

    #[test]
    fn listen_addrs_cover_tcp_and_quic() {
        let conf = Config::default();
        let addrs = conf.listen_addrs().unwrap();
        assert_eq!(
            addrs,
            vec![
                "/ip4/0.0.0.0/tcp/2002".parse::<Multiaddr>().unwrap(),
                "/ip4/0.0.0.0/udp/2002/quic-v1".parse::<Multiaddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn defaults_match_the_documented_ports() {
        let conf = Config::default();
        assert_eq!(conf.port, 2002);
        assert_eq!(conf.prometheus.port, 2004);
        assert_eq!(conf.pprof_port, 2003);
        assert_eq!(conf.database.port, 5432);
        assert_eq!(conf.database.ssl_mode, "disable");
        assert_eq!(conf.bootstrap_peers.len(), DEFAULT_BOOTSTRAP.len());
    }
}
