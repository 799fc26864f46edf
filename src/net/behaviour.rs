use iroh_bitswap::{Bitswap, BitswapConfig, BitswapEvent};
use libp2p::identify;
use libp2p::identity::Keypair;
use libp2p::kad::record::store::MemoryStore;
use libp2p::kad::{Kademlia, KademliaConfig, KademliaEvent};
use libp2p::ping;
use libp2p::swarm::NetworkBehaviour;

/// Libp2p behaviour for the probe host.
///
/// Kademlia announces our probe CIDs and resolves provider records, identify
/// feeds the peer catalog, and bitswap is where the observation happens:
/// every inbound want-list goes through the tracer.
#[derive(NetworkBehaviour)]
#[behaviour(out_event = "Event")]
pub(crate) struct NodeBehaviour {
    pub(crate) ping: ping::Behaviour,
    pub(crate) identify: identify::Behaviour,
    pub(crate) kad: Kademlia<MemoryStore>,
    pub(crate) bitswap: Bitswap,
}

/// Event type emitted from the [`NodeBehaviour`].
#[derive(Debug)]
pub(crate) enum Event {
    Ping(ping::Event),
    Identify(Box<identify::Event>),
    Kademlia(KademliaEvent),
    Bitswap(BitswapEvent),
}

impl From<ping::Event> for Event {
    fn from(event: ping::Event) -> Self {
        Event::Ping(event)
    }
}

impl From<identify::Event> for Event {
    fn from(event: identify::Event) -> Self {
        Event::Identify(Box::new(event))
    }
}

impl From<KademliaEvent> for Event {
    fn from(event: KademliaEvent) -> Self {
        Event::Kademlia(event)
    }
}

impl From<BitswapEvent> for Event {
    fn from(event: BitswapEvent) -> Self {
        Event::Bitswap(event)
    }
}

impl NodeBehaviour {
    pub(crate) fn new(keypair: &Keypair, agent_version: String) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let kad = Kademlia::with_config(
            peer_id,
            MemoryStore::new(peer_id),
            KademliaConfig::default(),
        );
        let identify = identify::Behaviour::new(
            identify::Config::new("ipfs/0.1.0".into(), keypair.public())
                .with_agent_version(agent_version),
        );

        NodeBehaviour {
            ping: ping::Behaviour::default(),
            identify,
            kad,
            bitswap: Bitswap::new(BitswapConfig::default()),
        }
    }
}
