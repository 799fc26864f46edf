use std::collections::HashSet;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{anyhow, Result};
use futures::stream::StreamExt;
use iroh_bitswap::BitswapEvent;
use libp2p::identity::Keypair;
use libp2p::kad::{
    self, BootstrapOk, GetProvidersOk, KademliaEvent, QueryId, QueryResult,
};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionHandler, IntoConnectionHandler, NetworkBehaviour, SwarmEvent};
use libp2p::{identify, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::store::BlockStore;
use crate::tracer::Tracer;

use super::behaviour::{Event, NodeBehaviour};
use super::client::{AddrInfo, NetworkClient, NodeCommand};
use super::peer_info::PeerCatalog;
use super::swarm::build_swarm;

const COMMAND_CHANNEL_SIZE: usize = 64;
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Owns the swarm and runs it in its own task.
///
/// Everything probes need from the network goes through [`NodeCommand`]s;
/// everything the network produces that probes care about flows out through
/// the tracer (sightings) and the response channels of pending queries.
pub struct Node {
    swarm: Swarm<NodeBehaviour>,
    commands: mpsc::Receiver<NodeCommand>,
    tracer: Tracer,
    store: BlockStore,
    catalog: PeerCatalog,
    dial_queries: AHashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    provide_queries: AHashMap<QueryId, oneshot::Sender<Result<()>>>,
    provider_queries: AHashMap<QueryId, ProviderQuery>,
}

struct ProviderQuery {
    limit: usize,
    found: HashSet<PeerId>,
    resp: oneshot::Sender<Result<Vec<AddrInfo>>>,
}

impl Node {
    pub fn new(
        keypair: &Keypair,
        listen_addrs: &[Multiaddr],
        agent_version: String,
        tracer: Tracer,
        store: BlockStore,
    ) -> Result<(Self, NetworkClient)> {
        let behaviour = NodeBehaviour::new(keypair, agent_version);
        let mut swarm = build_swarm(keypair, behaviour)?;

        for addr in listen_addrs {
            Swarm::listen_on(&mut swarm, addr.clone())?;
        }

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let client = NetworkClient::new(tx, keypair.public().to_peer_id());

        let node = Node {
            swarm,
            commands: rx,
            tracer,
            store,
            catalog: PeerCatalog::default(),
            dial_queries: Default::default(),
            provide_queries: Default::default(),
            provider_queries: Default::default(),
        };

        Ok((node, client))
    }

    /// Drives the swarm until the token is cancelled or the last client
    /// handle is dropped.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!(peer_id = %self.swarm.local_peer_id(), "network node running");

        let mut bootstrap_interval = interval_at(
            Instant::now() + BOOTSTRAP_INTERVAL,
            BOOTSTRAP_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                swarm_event = self.swarm.next() => {
                    let swarm_event = swarm_event.expect("the swarm never ends");
                    if let Err(err) = self.handle_swarm_event(swarm_event) {
                        warn!("swarm event: {err:?}");
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => return Ok(()),
                    }
                }
                _ = bootstrap_interval.tick() => {
                    if let Err(err) = self.swarm.behaviour_mut().kad.bootstrap() {
                        warn!("kad bootstrap failed: {err:?}");
                    }
                }
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn handle_swarm_event(
        &mut self,
        event: SwarmEvent<
            <NodeBehaviour as NetworkBehaviour>::OutEvent,
            <<<NodeBehaviour as NetworkBehaviour>::ConnectionHandler as IntoConnectionHandler>::Handler as ConnectionHandler>::Error>,
    ) -> Result<()> {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                trace!(peer = %peer_id, "connection established");
                self.catalog
                    .connection_opened(peer_id, endpoint.get_remote_address().clone());

                if let Some(channels) = self.dial_queries.get_mut(&peer_id) {
                    while let Some(channel) = channels.pop() {
                        channel.send(Ok(())).ok();
                    }
                }
                Ok(())
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.catalog.connection_closed(&peer_id);
                }
                trace!(peer = %peer_id, "connection closed");
                Ok(())
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error } => {
                trace!("failed to dial: {peer_id:?}, {error:?}");
                if let Some(peer_id) = peer_id {
                    if let Some(channels) = self.dial_queries.get_mut(&peer_id) {
                        while let Some(channel) = channels.pop() {
                            channel
                                .send(Err(anyhow!("error dialing peer {peer_id:?}: {error}")))
                                .ok();
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_behaviour_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Bitswap(event) => match event {
                BitswapEvent::ReceivedWant(peer_id, cid, _priority) => {
                    debug!(peer = %peer_id, %cid, "received want");
                    self.tracer.want_received(peer_id, &cid);

                    // serve the block so the target's fetch succeeds
                    if let Some(data) = self.store.get(&cid) {
                        info!(peer = %peer_id, %cid, "serving probe block");
                        self.swarm
                            .behaviour_mut()
                            .bitswap
                            .send_block(&peer_id, cid, data);
                    }
                }
                BitswapEvent::ReceivedBlock(peer_id, cid, _data) => {
                    trace!(peer = %peer_id, %cid, "ignoring received block");
                }
                BitswapEvent::ReceivedCancel(peer_id, cid) => {
                    trace!(peer = %peer_id, %cid, "received cancel");
                }
            },
            Event::Identify(event) => {
                if let identify::Event::Received { peer_id, info } = *event {
                    trace!(peer = %peer_id, agent = %info.agent_version, "identify received");

                    for protocol in &info.protocols {
                        if protocol.as_bytes() == kad::protocol::DEFAULT_PROTO_NAME {
                            for addr in &info.listen_addrs {
                                self.swarm
                                    .behaviour_mut()
                                    .kad
                                    .add_address(&peer_id, addr.clone());
                            }
                        }
                    }

                    self.catalog.inject_identify(peer_id, &info);
                }
            }
            Event::Kademlia(event) => {
                if let KademliaEvent::OutboundQueryProgressed {
                    id, result, step, ..
                } = event
                {
                    match result {
                        QueryResult::StartProviding(res) => {
                            if let Some(resp) = self.provide_queries.remove(&id) {
                                resp.send(res.map(|_| ()).map_err(|err| anyhow!(err)))
                                    .ok();
                            }
                        }
                        QueryResult::GetProviders(Ok(GetProvidersOk {
                            key, providers, ..
                        })) => {
                            debug!(?key, count = providers.len(), last = step.last, "providers");
                            self.handle_providers_progress(id, providers, step.last);
                        }
                        QueryResult::GetProviders(Err(err)) => {
                            debug!("get providers failed: {err:?}");
                            self.finish_provider_query(id);
                        }
                        QueryResult::Bootstrap(Ok(BootstrapOk {
                            peer,
                            num_remaining,
                        })) => {
                            debug!(?peer, num_remaining, "kad bootstrap step done");
                        }
                        QueryResult::Bootstrap(Err(err)) => {
                            warn!("kad bootstrap error: {err:?}");
                        }
                        other => {
                            trace!("unhandled kademlia query result: {other:?}");
                        }
                    }
                }
            }
            Event::Ping(_) => {}
        }

        Ok(())
    }

    fn handle_providers_progress(
        &mut self,
        id: QueryId,
        providers: HashSet<PeerId>,
        last: bool,
    ) {
        let Some(query) = self.provider_queries.get_mut(&id) else {
            return;
        };
        query.found.extend(providers);

        let done = query.found.len() >= query.limit;
        if done {
            if let Some(mut kad_query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                kad_query.finish();
            }
        }
        if done || last {
            self.finish_provider_query(id);
        }
    }

    fn finish_provider_query(&mut self, id: QueryId) {
        let Some(query) = self.provider_queries.remove(&id) else {
            return;
        };

        let mut infos = Vec::with_capacity(query.found.len());
        for peer_id in query.found {
            let addrs = self.swarm.behaviour_mut().addresses_of_peer(&peer_id);
            infos.push(AddrInfo { peer_id, addrs });
        }
        query.resp.send(Ok(infos)).ok();
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Addrs { resp } => {
                let mut addrs: Vec<Multiaddr> = Swarm::listeners(&self.swarm).cloned().collect();
                addrs.extend(
                    Swarm::external_addresses(&self.swarm).map(|record| record.addr.clone()),
                );
                resp.send(addrs).ok();
            }
            NodeCommand::StartProviding { cid, resp } => {
                debug!(%cid, "providing cid in the dht");
                match self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .start_providing(cid.hash().to_bytes().into())
                {
                    Ok(query_id) => {
                        self.provide_queries.insert(query_id, resp);
                    }
                    Err(err) => {
                        resp.send(Err(anyhow!("start providing: {err:?}"))).ok();
                    }
                }
            }
            NodeCommand::StopProviding { cid } => {
                self.swarm
                    .behaviour_mut()
                    .kad
                    .stop_providing(&cid.hash().to_bytes().into());
            }
            NodeCommand::FindProviders { cid, limit, resp } => {
                debug!(%cid, "fetching providers from the dht");
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_providers(cid.hash().to_bytes().into());
                self.provider_queries.insert(
                    query_id,
                    ProviderQuery {
                        limit,
                        found: HashSet::new(),
                        resp,
                    },
                );
            }
            NodeCommand::Connect { addr_info, resp } => {
                let AddrInfo { peer_id, addrs } = addr_info;
                if self.swarm.is_connected(&peer_id) {
                    resp.send(Ok(())).ok();
                    return;
                }

                let channels = self.dial_queries.entry(peer_id).or_default();
                channels.push(resp);

                // the p2p component trips up DialOpts when it is part of the
                // dialed addresses
                let addrs = addrs
                    .iter()
                    .map(|a| {
                        a.iter()
                            .filter(|p| !matches!(*p, Protocol::P2p(_)))
                            .collect()
                    })
                    .collect();
                let dial_opts = DialOpts::peer_id(peer_id)
                    .addresses(addrs)
                    .condition(PeerCondition::Always)
                    .build();
                if let Err(err) = Swarm::dial(&mut self.swarm, dial_opts) {
                    warn!("invalid dial options: {err:?}");
                    if let Some(channels) = self.dial_queries.get_mut(&peer_id) {
                        while let Some(channel) = channels.pop() {
                            channel
                                .send(Err(anyhow!("error dialing peer {peer_id:?}: {err}")))
                                .ok();
                        }
                    }
                }
            }
            NodeCommand::PeerInfo { peer_id, resp } => {
                resp.send(self.catalog.info(&peer_id)).ok();
            }
        }
    }
}
