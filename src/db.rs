use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

/// A tracked peer, keyed by (multi_hash, target_name).
///
/// The ip/country/continent/asn sequences are sorted ascending before they
/// get here; sort order is part of the persistence contract.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub multi_hash: String,
    pub agent_version: Option<String>,
    pub protocols: Vec<String>,
    pub multi_addresses: Vec<String>,
    pub ip_addresses: Vec<String>,
    pub countries: Vec<String>,
    pub continents: Vec<String>,
    pub asns: Vec<i64>,
    pub target_type: String,
    pub target_name: String,
    pub last_seen_at: DateTime<Utc>,
}

/// The upsert contract of the relational peer store.
///
/// Upserting the same key twice with identical attributes yields one row.
/// Attributes that arrive non-empty replace the stored value; empty arrivals
/// preserve whatever was there. `last_seen_at` is always refreshed.
#[async_trait]
pub trait PeerStore: Send + Sync + fmt::Debug {
    async fn upsert(&self, record: PeerRecord) -> Result<()>;
}

/// Postgres-backed peer store.
pub struct Client {
    client: tokio_postgres::Client,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish()
    }
}

impl Client {
    pub async fn connect(conf: &DatabaseConfig) -> Result<Self> {
        info!(
            host = conf.host,
            port = conf.port,
            name = conf.name,
            user = conf.user,
            ssl = conf.ssl_mode,
            "initializing database client"
        );

        let params = format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            conf.host, conf.port, conf.name, conf.user, conf.password, conf.ssl_mode,
        );
        let (client, connection) = tokio_postgres::connect(&params, NoTls)
            .await
            .context("opening database")?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("database connection error: {err}");
            }
        });

        // fail fast before the first probe needs the store
        client
            .simple_query("SELECT 1")
            .await
            .context("pinging database")?;

        Ok(Client { client })
    }
}

#[async_trait]
impl PeerStore for Client {
    async fn upsert(&self, record: PeerRecord) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO peers (
                    multi_hash, agent_version, protocols, multi_addresses, ip_addresses,
                    countries, continents, asns, target_type, target_name, last_seen_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (multi_hash, target_name) DO UPDATE SET
                    agent_version = COALESCE(EXCLUDED.agent_version, peers.agent_version),
                    protocols = CASE WHEN cardinality(EXCLUDED.protocols) = 0
                        THEN peers.protocols ELSE EXCLUDED.protocols END,
                    multi_addresses = CASE WHEN cardinality(EXCLUDED.multi_addresses) = 0
                        THEN peers.multi_addresses ELSE EXCLUDED.multi_addresses END,
                    ip_addresses = CASE WHEN cardinality(EXCLUDED.ip_addresses) = 0
                        THEN peers.ip_addresses ELSE EXCLUDED.ip_addresses END,
                    countries = CASE WHEN cardinality(EXCLUDED.countries) = 0
                        THEN peers.countries ELSE EXCLUDED.countries END,
                    continents = CASE WHEN cardinality(EXCLUDED.continents) = 0
                        THEN peers.continents ELSE EXCLUDED.continents END,
                    asns = CASE WHEN cardinality(EXCLUDED.asns) = 0
                        THEN peers.asns ELSE EXCLUDED.asns END,
                    target_type = EXCLUDED.target_type,
                    last_seen_at = EXCLUDED.last_seen_at",
                &[
                    &record.multi_hash,
                    &record.agent_version,
                    &record.protocols,
                    &record.multi_addresses,
                    &record.ip_addresses,
                    &record.countries,
                    &record.continents,
                    &record.asns,
                    &record.target_type,
                    &record.target_name,
                    &record.last_seen_at,
                ],
            )
            .await
            .context("upsert db peer")?;

        Ok(())
    }
}

/// In-memory peer store with the same merge semantics, for tests and
/// development runs without a database.
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    peers: Mutex<HashMap<(String, String), PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, multi_hash: &str, target_name: &str) -> Option<PeerRecord> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .get(&(multi_hash.to_string(), target_name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn upsert(&self, record: PeerRecord) -> Result<()> {
        let key = (record.multi_hash.clone(), record.target_name.clone());
        let mut peers = self.peers.lock().expect("peer store lock poisoned");

        match peers.get_mut(&key) {
            None => {
                peers.insert(key, record);
            }
            Some(existing) => merge_record(existing, record),
        }

        Ok(())
    }
}

/// Non-empty attributes replace, empty ones preserve; last_seen_at always
/// moves forward.
fn merge_record(existing: &mut PeerRecord, update: PeerRecord) {
    if update.agent_version.is_some() {
        existing.agent_version = update.agent_version;
    }
    if !update.protocols.is_empty() {
        existing.protocols = update.protocols;
    }
    if !update.multi_addresses.is_empty() {
        existing.multi_addresses = update.multi_addresses;
    }
    if !update.ip_addresses.is_empty() {
        existing.ip_addresses = update.ip_addresses;
    }
    if !update.countries.is_empty() {
        existing.countries = update.countries;
    }
    if !update.continents.is_empty() {
        existing.continents = update.continents;
    }
    if !update.asns.is_empty() {
        existing.asns = update.asns;
    }
    existing.target_type = update.target_type;
    existing.last_seen_at = update.last_seen_at;
}
