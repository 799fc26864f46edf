use ahash::AHashMap;
use libp2p::{identify, Multiaddr, PeerId};

/// Everything we know about a peer at tracking time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerInfo {
    pub agent_version: Option<String>,
    pub protocols: Vec<String>,
    /// Union of identify-advertised addresses and live connection remotes,
    /// deduplicated. Unfiltered; the tracking pipeline decides what counts.
    pub addresses: Vec<Multiaddr>,
}

/// Identify-fed catalog of peer attributes, the stand-in for a full peerstore.
#[derive(Debug, Default)]
pub(crate) struct PeerCatalog {
    identified: AHashMap<PeerId, IdentifyRecord>,
    connections: AHashMap<PeerId, Vec<Multiaddr>>,
}

#[derive(Debug, Clone)]
struct IdentifyRecord {
    agent_version: String,
    protocols: Vec<String>,
    listen_addrs: Vec<Multiaddr>,
}

impl PeerCatalog {
    pub(crate) fn inject_identify(&mut self, peer_id: PeerId, info: &identify::Info) {
        self.identified.insert(
            peer_id,
            IdentifyRecord {
                agent_version: info.agent_version.clone(),
                protocols: info.protocols.clone(),
                listen_addrs: info.listen_addrs.clone(),
            },
        );
    }

    pub(crate) fn connection_opened(&mut self, peer_id: PeerId, remote_addr: Multiaddr) {
        let addrs = self.connections.entry(peer_id).or_default();
        if !addrs.contains(&remote_addr) {
            addrs.push(remote_addr);
        }
    }

    pub(crate) fn connection_closed(&mut self, peer_id: &PeerId) {
        self.connections.remove(peer_id);
    }

    pub(crate) fn info(&self, peer_id: &PeerId) -> PeerInfo {
        let mut info = PeerInfo::default();

        if let Some(record) = self.identified.get(peer_id) {
            if !record.agent_version.is_empty() {
                info.agent_version = Some(record.agent_version.clone());
            }
            info.protocols = record.protocols.clone();
            info.addresses = record.listen_addrs.clone();
        }

        if let Some(addrs) = self.connections.get(peer_id) {
            for addr in addrs {
                if !info.addresses.contains(addr) {
                    info.addresses.push(addr.clone());
                }
            }
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_identify_and_connection_addresses() {
        let mut catalog = PeerCatalog::default();
        let peer = PeerId::random();

        let listen: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        let remote: Multiaddr = "/ip4/1.2.3.4/udp/4001/quic-v1".parse().unwrap();

        catalog.inject_identify(peer, &identify_info(vec![listen.clone()]));
        catalog.connection_opened(peer, remote.clone());
        // the same address from both sources shows up once
        catalog.connection_opened(peer, listen.clone());

        let info = catalog.info(&peer);
        assert_eq!(info.addresses, vec![listen, remote]);
        assert_eq!(info.agent_version.as_deref(), Some("kubo/0.18.0"));
    }

    #[test]
    fn unknown_peer_yields_empty_info() {
        let catalog = PeerCatalog::default();
        let info = catalog.info(&PeerId::random());
        assert_eq!(info, PeerInfo::default());
    }

    fn identify_info(listen_addrs: Vec<Multiaddr>) -> identify::Info {
        let keypair = libp2p::identity::Keypair::generate_ed25519();
        identify::Info {
            public_key: keypair.public(),
            protocol_version: "ipfs/0.1.0".into(),
            agent_version: "kubo/0.18.0".into(),
            listen_addrs,
            protocols: vec!["/ipfs/kad/1.0.0".into()],
            observed_addr: "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
        }
    }
}
