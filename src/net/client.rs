use anyhow::{anyhow, Context, Result};
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};

use super::peer_info::PeerInfo;

/// A peer together with the addresses it can be reached at.
#[derive(Debug, Clone, PartialEq)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// Requests the probes send to the node task.
#[derive(Debug)]
pub enum NodeCommand {
    /// Our own listen and externally observed addresses.
    Addrs {
        resp: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Announce a CID on the DHT; resolves when the provide query finishes.
    StartProviding {
        cid: Cid,
        resp: oneshot::Sender<Result<()>>,
    },
    StopProviding { cid: Cid },
    /// Resolve provider records for a CID, up to `limit` peers.
    FindProviders {
        cid: Cid,
        limit: usize,
        resp: oneshot::Sender<Result<Vec<AddrInfo>>>,
    },
    /// Dial a peer; resolves once a connection is established.
    Connect {
        addr_info: AddrInfo,
        resp: oneshot::Sender<Result<()>>,
    },
    /// Snapshot of what the peer catalog knows about a peer.
    PeerInfo {
        peer_id: PeerId,
        resp: oneshot::Sender<PeerInfo>,
    },
}

/// Cloneable in-process handle to the node task. Every call is a command
/// with a oneshot response; a closed channel means the node stopped.
#[derive(Debug, Clone)]
pub struct NetworkClient {
    commands: mpsc::Sender<NodeCommand>,
    local_peer_id: PeerId,
}

impl NetworkClient {
    pub fn new(commands: mpsc::Sender<NodeCommand>, local_peer_id: PeerId) -> Self {
        NetworkClient {
            commands,
            local_peer_id,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub async fn addrs(&self) -> Result<Vec<Multiaddr>> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Addrs { resp: tx }).await?;
        rx.await.map_err(|_| anyhow!("node stopped"))
    }

    pub async fn provide(&self, cid: Cid) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::StartProviding { cid, resp: tx })
            .await?;
        rx.await.map_err(|_| anyhow!("node stopped"))?
    }

    pub async fn stop_providing(&self, cid: Cid) -> Result<()> {
        self.send(NodeCommand::StopProviding { cid }).await
    }

    pub async fn find_providers(&self, cid: Cid, limit: usize) -> Result<Vec<AddrInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::FindProviders {
            cid,
            limit,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("node stopped"))?
    }

    pub async fn connect(&self, addr_info: AddrInfo) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Connect {
            addr_info,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("node stopped"))?
    }

    pub async fn peer_info(&self, peer_id: PeerId) -> Result<PeerInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::PeerInfo { peer_id, resp: tx })
            .await?;
        rx.await.map_err(|_| anyhow!("node stopped"))
    }

    async fn send(&self, command: NodeCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .context("node command channel closed")
    }
}
