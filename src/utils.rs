use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::multiaddr::{Multiaddr, Protocol};
use thiserror::Error;

/// Marker error for aborted work. Cancellation and deadline expiry end an
/// iteration cleanly and must never be surfaced as a warning.
#[derive(Debug, Clone, Copy, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Returns true if the error chain contains a cancellation or an elapsed
/// timeout.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<Cancelled>() || cause.is::<tokio::time::error::Elapsed>()
    })
}

/// Returns true if the multiaddr goes through a circuit relay. Relayed
/// addresses name the relay, not the peer, and are never persisted.
pub fn is_relayed_maddr(maddr: &Multiaddr) -> bool {
    maddr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Returns true if the multiaddr starts with a publicly routable IP address
/// or a DNS name.
pub fn is_public_maddr(maddr: &Multiaddr) -> bool {
    match maddr.iter().next() {
        Some(Protocol::Ip4(addr)) => is_ipv4_global(addr),
        Some(Protocol::Ip6(addr)) => is_ipv6_global(addr),
        Some(Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_)) => {
            true
        }
        _ => false,
    }
}

// Stable adaptation of https://doc.rust-lang.org/std/net/struct.Ipv4Addr.html#method.is_global
pub(crate) const fn is_ipv4_global(addr: Ipv4Addr) -> bool {
    !(addr.octets()[0] == 0 // "This network"
        || addr.is_private()
        || (addr.octets()[0] == 100 && (addr.octets()[1] & 0b1100_0000 == 0b0100_0000)) // addr.is_shared()
        || addr.is_loopback()
        || addr.is_link_local()
        // addresses reserved for future protocols (`192.0.0.0/24`)
        || (addr.octets()[0] == 192 && addr.octets()[1] == 0 && addr.octets()[2] == 0)
        || addr.is_documentation()
        || (addr.octets()[0] == 198 && (addr.octets()[1] & 0xfe) == 18) // addr.is_benchmarking()
        || (addr.octets()[0] & 240 == 240 && !addr.is_broadcast()) // addr.is_reserved()
        || addr.is_broadcast())
}

// Stable adaptation of https://doc.rust-lang.org/std/net/struct.Ipv6Addr.html#method.is_global
pub(crate) const fn is_ipv6_global(addr: Ipv6Addr) -> bool {
    !(addr.is_unspecified()
        || addr.is_loopback()
        // IPv4-mapped Address (`::ffff:0:0/96`)
        || matches!(addr.segments(), [0, 0, 0, 0, 0, 0xffff, _, _])
        // IPv4-IPv6 Translat. (`64:ff9b:1::/48`)
        || matches!(addr.segments(), [0x64, 0xff9b, 1, _, _, _, _, _])
        // Discard-Only Address Block (`100::/64`)
        || matches!(addr.segments(), [0x100, 0, 0, 0, _, _, _, _])
        // IETF Protocol Assignments (`2001::/23`)
        || (matches!(addr.segments(), [0x2001, b, _, _, _, _, _, _] if b < 0x200))
        || ((addr.segments()[0] == 0x2001) && (addr.segments()[1] == 0xdb8)) // addr.is_documentation()
        || ((addr.segments()[0] & 0xfe00) == 0xfc00) // addr.is_unique_local()
        || ((addr.segments()[0] & 0xffc0) == 0xfe80)) // addr.is_unicast_link_local()
}
