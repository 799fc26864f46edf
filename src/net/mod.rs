//! The libp2p side of the probe engine: one task owns the swarm and serves
//! the probes through a channel-based client handle.

mod behaviour;
mod client;
mod node;
mod peer_info;
mod swarm;

pub use client::{AddrInfo, NetworkClient, NodeCommand};
pub use node::Node;
pub use peer_info::PeerInfo;
