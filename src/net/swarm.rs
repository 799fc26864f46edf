use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::{
    core::{
        self,
        muxing::StreamMuxerBox,
        transport::{Boxed, OrTransport},
    },
    dns,
    identity::Keypair,
    noise, quic,
    swarm::{derive_prelude::EitherOutput, ConnectionLimits, Executor, SwarmBuilder},
    tcp,
    yamux::YamuxConfig,
    PeerId, Swarm, Transport,
};

use super::behaviour::NodeBehaviour;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the transport stack: TCP and QUIC over IPv4, with DNS resolution
/// for bootstrap and gateway addresses.
fn build_transport(keypair: &Keypair) -> Result<Boxed<(PeerId, StreamMuxerBox)>> {
    let tcp_config = tcp::Config::default().port_reuse(true);
    let tcp_transport = tcp::tokio::Transport::new(tcp_config);

    let auth_config = {
        let dh_keys = noise::Keypair::<noise::X25519Spec>::new()
            .into_authentic(keypair)
            .context("noise key generation")?;
        noise::NoiseConfig::xx(dh_keys).into_authenticated()
    };

    let tcp_transport = tcp_transport
        .upgrade(core::upgrade::Version::V1Lazy)
        .authenticate(auth_config)
        .multiplex(YamuxConfig::default())
        .timeout(CONNECTION_TIMEOUT);

    let quic_config = quic::Config::new(keypair);
    let quic_transport = quic::tokio::Transport::new(quic_config);

    let transport = OrTransport::new(quic_transport, tcp_transport)
        .map(|o, _| match o {
            EitherOutput::First((peer_id, muxer)) => (peer_id, StreamMuxerBox::new(muxer)),
            EitherOutput::Second((peer_id, muxer)) => (peer_id, StreamMuxerBox::new(muxer)),
        })
        .boxed();

    let dns_cfg = dns::ResolverConfig::cloudflare();
    let dns_opts = dns::ResolverOpts::default();
    let transport = dns::TokioDnsConfig::custom(transport, dns_cfg, dns_opts)
        .context("dns transport")?
        .boxed();

    Ok(transport)
}

pub(crate) fn build_swarm(
    keypair: &Keypair,
    behaviour: NodeBehaviour,
) -> Result<Swarm<NodeBehaviour>> {
    let peer_id = keypair.public().to_peer_id();
    let transport = build_transport(keypair)?;

    let swarm = SwarmBuilder::with_executor(transport, behaviour, peer_id, Tokio)
        .connection_limits(ConnectionLimits::default())
        .build();

    Ok(swarm)
}

struct Tokio;

impl Executor for Tokio {
    fn exec(&self, fut: std::pin::Pin<Box<dyn futures::Future<Output = ()> + Send>>) {
        tokio::task::spawn(fut);
    }
}
