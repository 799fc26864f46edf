use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::db::PeerStore;
use crate::geo::GeoClient;
use crate::metrics::Metrics;
use crate::net::{AddrInfo, NetworkClient, Node};
use crate::probe::{Probe, UploadProbe};
use crate::store::BlockStore;
use crate::target::{
    Gateway, Honeypot, Infura, Pinata, Target, Web3Storage, INFURA_TARGET_NAME,
    PINATA_TARGET_NAME, WEB3_TARGET_NAME,
};
use crate::tracer::Tracer;
use crate::tracking::Tracker;

/// Builds the network node and the targets, fans out one probe per target
/// and joins them all on shutdown.
pub struct Scheduler {
    config: Config,
    node: Option<Node>,
    client: NetworkClient,
    store: BlockStore,
    tracer: Tracer,
    tracker: Tracker,
    metrics: Metrics,
    targets: Vec<Arc<dyn Target>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        db: Option<Arc<dyn PeerStore>>,
        geo: Arc<GeoClient>,
        metrics: Metrics,
    ) -> Result<Self> {
        let keypair = config.keypair()?;
        let tracer = Tracer::new();
        let store = BlockStore::new();

        let agent_version = format!("antares/{}", env!("CARGO_PKG_VERSION"));
        let (node, client) = Node::new(
            &keypair,
            &config.listen_addrs()?,
            agent_version,
            tracer.clone(),
            store.clone(),
        )
        .context("new libp2p node")?;

        let tracker = Tracker::new(
            client.clone(),
            db,
            geo,
            metrics.clone(),
            config.database.dry_run,
        );

        let mut targets: Vec<Arc<dyn Target>> = vec![Arc::new(Honeypot::new())];
        for gateway in &config.gateways {
            targets.push(Arc::new(Gateway::new(&gateway.name, &gateway.url)));
        }
        for service in &config.pinning_services {
            let target: Arc<dyn Target> = match service.target.as_str() {
                PINATA_TARGET_NAME => {
                    Arc::new(Pinata::new(client.clone(), &service.authorization))
                }
                INFURA_TARGET_NAME => Arc::new(Infura::new(&service.authorization)?),
                other => bail!("unknown pinning service {other:?}"),
            };
            targets.push(target);
        }
        for service in &config.upload_services {
            let target: Arc<dyn Target> = match service.target.as_str() {
                WEB3_TARGET_NAME => Arc::new(Web3Storage::new(&service.authorization)),
                other => bail!("unknown upload service {other:?}"),
            };
            targets.push(target);
        }

        Ok(Scheduler {
            config,
            node: Some(node),
            client,
            store,
            tracer,
            tracker,
            metrics,
            targets,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.client.local_peer_id()
    }

    /// Connects to the bootstrap peers, starts one probe per target and
    /// blocks until the token is cancelled. On shutdown every probe is
    /// awaited before the node itself stops.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let node = self.node.take().context("scheduler already started")?;

        // the node outlives the probes so their cleanup can still reach it
        let node_token = CancellationToken::new();
        let node_task = tokio::spawn(node.run(node_token.clone()));

        for addr in &self.config.bootstrap_peers {
            let info = bootstrap_addr_info(addr)?;
            info!(peer = %info.peer_id, "connecting to bootstrap peer");
            self.client
                .connect(info)
                .await
                .context("connect to bootstrap peer")?;
        }

        let keypair = self.config.keypair()?;
        let mut probes = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            info!("starting {} probe {}...", target.kind(), target.name());

            let handle = if target.as_upload().is_some() {
                let probe = UploadProbe::new(
                    self.client.clone(),
                    keypair.clone(),
                    target.clone(),
                    self.tracker.clone(),
                    self.metrics.clone(),
                );
                tokio::spawn(probe.run(token.clone()))
            } else {
                let probe = Probe::new(
                    self.client.clone(),
                    self.store.clone(),
                    self.tracer.clone(),
                    keypair.clone(),
                    target.clone(),
                    self.tracker.clone(),
                    self.metrics.clone(),
                );
                tokio::spawn(probe.run(token.clone()))
            };
            probes.push((target.clone(), handle));
        }

        info!(count = self.targets.len(), "initialized all target probes");
        token.cancelled().await;

        for (target, handle) in probes {
            info!(
                name = target.name(),
                kind = %target.kind(),
                "waiting for probe to stop"
            );
            handle.await.ok();
        }

        node_token.cancel();
        node_task.await.context("join node task")?
    }
}

/// Splits a bootstrap multiaddr into the peer id and its dial address.
fn bootstrap_addr_info(maddr: &Multiaddr) -> Result<AddrInfo> {
    let peer_id = maddr
        .iter()
        .find_map(|p| match p {
            Protocol::P2p(hash) => PeerId::from_multihash(hash).ok(),
            _ => None,
        })
        .ok_or_else(|| anyhow!("bootstrap peer {maddr} carries no peer id"))?;

    Ok(AddrInfo {
        peer_id,
        addrs: vec![maddr.clone()],
    })
}
