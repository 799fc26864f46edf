use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use libp2p::PeerId;
use tracing::{debug, info};

use crate::db::{PeerRecord, PeerStore};
use crate::geo::GeoClient;
use crate::metrics::Metrics;
use crate::net::NetworkClient;
use crate::target::Target;
use crate::utils;

/// Turns an observed peer into a persisted peer record.
///
/// Shared by the pinning/gateway probes (which observe via the tracer) and
/// the upload probes (which observe via DHT provider records).
#[derive(Debug, Clone)]
pub struct Tracker {
    client: NetworkClient,
    db: Option<Arc<dyn PeerStore>>,
    geo: Arc<GeoClient>,
    metrics: Metrics,
    dry_run: bool,
}

impl Tracker {
    pub fn new(
        client: NetworkClient,
        db: Option<Arc<dyn PeerStore>>,
        geo: Arc<GeoClient>,
        metrics: Metrics,
        dry_run: bool,
    ) -> Self {
        Tracker {
            client,
            db,
            geo,
            metrics,
            dry_run,
        }
    }

    /// Gathers a peer's attributes and upserts its record.
    ///
    /// Relayed and non-public addresses never make it into the record. The
    /// ip/country/continent/asn sequences come out sorted ascending; that
    /// ordering is part of the persistence contract.
    pub async fn track_peer(&self, peer_id: PeerId, target: &dyn Target) -> Result<()> {
        self.metrics.record_track(target);

        let peer_info = self
            .client
            .peer_info(peer_id)
            .await
            .context("query peer info")?;

        // dedup by string representation
        let maddrs: BTreeMap<String, _> = peer_info
            .addresses
            .into_iter()
            .map(|maddr| (maddr.to_string(), maddr))
            .collect();

        let mut maddr_strs = Vec::new();
        let mut ip_addresses = BTreeSet::new();
        let mut countries = BTreeSet::new();
        let mut continents = BTreeSet::new();
        let mut asns = BTreeSet::new();

        for (maddr_str, maddr) in maddrs {
            if utils::is_relayed_maddr(&maddr) || !utils::is_public_maddr(&maddr) {
                continue;
            }

            maddr_strs.push(maddr_str);

            let infos = match self.geo.maddr_info(&maddr).await {
                Ok(infos) => infos,
                Err(err) => {
                    debug!(%maddr, "geo lookup failed: {err:#}");
                    continue;
                }
            };
            for (ip_address, maddr_info) in infos {
                ip_addresses.insert(ip_address);
                countries.insert(maddr_info.country);
                continents.insert(maddr_info.continent);
                asns.insert(i64::from(maddr_info.asn));
            }
        }

        ip_addresses.remove("");
        countries.remove("");
        continents.remove("");
        asns.remove(&0);

        let record = PeerRecord {
            multi_hash: peer_id.to_base58(),
            agent_version: peer_info.agent_version,
            protocols: peer_info.protocols,
            multi_addresses: maddr_strs,
            ip_addresses: ip_addresses.into_iter().collect(),
            countries: countries.into_iter().collect(),
            continents: continents.into_iter().collect(),
            asns: asns.into_iter().collect(),
            target_type: target.kind().as_str().to_string(),
            target_name: target.name().to_string(),
            last_seen_at: Utc::now(),
        };

        if self.dry_run {
            dump_record(&record);
            return Ok(());
        }

        let db = self.db.as_ref().context("no database client")?;
        db.upsert(record).await
    }
}

/// The dry-run stand-in for the upsert: a structured dump of everything that
/// would have been written.
fn dump_record(record: &PeerRecord) {
    info!("Skipping database interaction due to dry-run configuration");

    info!("Tracked the following peer:");
    info!("  PeerID {}", record.multi_hash);
    info!(
        "  AgentVersion {}",
        record.agent_version.as_deref().unwrap_or_default()
    );
    info!("  Protocols");
    for (i, protocol) in record.protocols.iter().enumerate() {
        info!("    [{i}] {protocol}");
    }
    info!("  MultiAddresses");
    for (i, maddr) in record.multi_addresses.iter().enumerate() {
        info!("    [{i}] {maddr}");
    }
    info!("  IPAddresses");
    for (i, ip) in record.ip_addresses.iter().enumerate() {
        info!("    [{i}] {ip}");
    }
    info!("  Countries {:?}", record.countries);
    info!("  Continents {:?}", record.continents);
    info!("  ASNs {:?}", record.asns);
    info!("  TargetType {}", record.target_type);
    info!("  TargetName {}", record.target_name);
}

#[cfg(test)]
mod tests {
    use libp2p::Multiaddr;
    use tokio::sync::mpsc;

    use crate::db::MemoryPeerStore;
    use crate::net::{NodeCommand, PeerInfo};
    use crate::target::Honeypot;

    use super::*;

    /// Answers `PeerInfo` commands with a fixed response, standing in for
    /// the node task.
    fn stub_node(peer_info: PeerInfo) -> NetworkClient {
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let NodeCommand::PeerInfo { resp, .. } = command {
                    resp.send(peer_info.clone()).ok();
                }
            }
        });
        NetworkClient::new(tx, PeerId::random())
    }

    fn tracker(client: NetworkClient, db: Arc<MemoryPeerStore>) -> Tracker {
        Tracker::new(
            client,
            Some(db as Arc<dyn PeerStore>),
            Arc::new(GeoClient::empty()),
            Metrics::default(),
            false,
        )
    }

    #[tokio::test]
    async fn filters_relayed_and_private_addresses() {
        let peer_id = PeerId::random();
        let addresses: Vec<Multiaddr> = vec![
            "/ip4/10.0.0.1/tcp/1".parse().unwrap(),
            "/ip4/1.2.3.4/tcp/4001/p2p-circuit".parse().unwrap(),
            "/ip4/1.2.3.4/tcp/1".parse().unwrap(),
        ];
        let client = stub_node(PeerInfo {
            agent_version: Some("kubo/0.18.0".into()),
            protocols: vec!["/ipfs/kad/1.0.0".into()],
            addresses,
        });

        let db = Arc::new(MemoryPeerStore::new());
        let target = Honeypot::new();
        tracker(client, db.clone())
            .track_peer(peer_id, &target)
            .await
            .unwrap();

        let record = db.get(&peer_id.to_base58(), "dummy").unwrap();
        assert_eq!(record.multi_addresses, vec!["/ip4/1.2.3.4/tcp/1"]);
        assert_eq!(record.ip_addresses, vec!["1.2.3.4"]);
        assert_eq!(record.target_type, "honeypot");
    }

    #[tokio::test]
    async fn ip_addresses_come_out_sorted() {
        let peer_id = PeerId::random();
        let addresses: Vec<Multiaddr> = vec![
            "/ip4/9.9.9.9/tcp/1".parse().unwrap(),
            "/ip4/1.2.3.4/tcp/1".parse().unwrap(),
        ];
        let client = stub_node(PeerInfo {
            agent_version: None,
            protocols: vec![],
            addresses,
        });

        let db = Arc::new(MemoryPeerStore::new());
        let target = Honeypot::new();
        tracker(client, db.clone())
            .track_peer(peer_id, &target)
            .await
            .unwrap();

        let record = db.get(&peer_id.to_base58(), "dummy").unwrap();
        assert_eq!(record.ip_addresses, vec!["1.2.3.4", "9.9.9.9"]);
        // no geo databases loaded, so no location attributes survive
        assert!(record.countries.is_empty());
        assert!(record.asns.is_empty());
    }

    #[tokio::test]
    async fn dry_run_skips_the_store_but_runs_the_pipeline() {
        let peer_id = PeerId::random();
        let client = stub_node(PeerInfo {
            agent_version: None,
            protocols: vec![],
            addresses: vec!["/ip4/1.2.3.4/tcp/1".parse().unwrap()],
        });

        let db = Arc::new(MemoryPeerStore::new());
        let tracker = Tracker::new(
            client,
            Some(db.clone() as Arc<dyn PeerStore>),
            Arc::new(GeoClient::empty()),
            Metrics::default(),
            true,
        );

        let target = Honeypot::new();
        tracker.track_peer(peer_id, &target).await.unwrap();
        assert!(db.is_empty());
    }
}
