//! End-to-end probe loop scenarios against stubbed network and HTTP
//! collaborators.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use chrono::Utc;
use cid::Cid;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use iroh_bitswap::Block;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use antares::db::{MemoryPeerStore, PeerStore};
use antares::geo::GeoClient;
use antares::metrics::Metrics;
use antares::net::{AddrInfo, NetworkClient, NodeCommand, PeerInfo};
use antares::payload::Payload;
use antares::probe::{Probe, UploadProbe};
use antares::store::BlockStore;
use antares::target::{
    CleanupTarget, Gateway, Honeypot, Pinata, PinTarget, Target, TargetKind, UploadTarget,
    Web3Storage,
};
use antares::tracer::Tracer;
use antares::tracking::Tracker;

/// Stands in for the node task: answers commands from canned data and
/// forwards every provided CID to the test.
struct StubNode {
    peer_info: PeerInfo,
    providers: Vec<AddrInfo>,
}

impl StubNode {
    fn with_public_peer() -> Self {
        StubNode {
            peer_info: PeerInfo {
                agent_version: Some("kubo/0.18.0".into()),
                protocols: vec!["/ipfs/kad/1.0.0".into()],
                addresses: vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()],
            },
            providers: Vec::new(),
        }
    }

    fn spawn(self) -> (NetworkClient, mpsc::UnboundedReceiver<Cid>) {
        let (tx, mut rx) = mpsc::channel(16);
        let (provided_tx, provided_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    NodeCommand::Addrs { resp } => {
                        resp.send(vec!["/ip4/1.2.3.4/tcp/4001".parse().unwrap()])
                            .ok();
                    }
                    NodeCommand::StartProviding { cid, resp } => {
                        provided_tx.send(cid).ok();
                        resp.send(Ok(())).ok();
                    }
                    NodeCommand::StopProviding { .. } => {}
                    NodeCommand::FindProviders { resp, .. } => {
                        resp.send(Ok(self.providers.clone())).ok();
                    }
                    NodeCommand::Connect { resp, .. } => {
                        resp.send(Ok(())).ok();
                    }
                    NodeCommand::PeerInfo { resp, .. } => {
                        resp.send(self.peer_info.clone()).ok();
                    }
                }
            }
        });

        (NetworkClient::new(tx, PeerId::random()), provided_rx)
    }
}

/// Local HTTP server that records request paths. `/hang/...` never responds,
/// everything else returns 200 with the given body (default `{}`).
async fn serve_stub(body: Option<String>) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let io = hyper_util::rt::TokioIo::new(stream);
            let tx = tx.clone();
            let body = body.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let tx = tx.clone();
                    let body = body.clone();
                    async move {
                        let path = req.uri().path().to_string();
                        tx.send(path.clone()).ok();
                        if path.starts_with("/hang") {
                            std::future::pending::<()>().await;
                        }
                        let body = body.unwrap_or_else(|| "{}".to_string());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    }
                });
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                    .ok();
            });
        }
    });

    (addr, rx)
}

/// A pinning-style target with test-sized rate and timeout, talking to the
/// stub HTTP server.
#[derive(Debug)]
struct StubService {
    base_url: String,
    hang: bool,
    timeout: Duration,
    client: reqwest::Client,
}

impl StubService {
    fn new(addr: SocketAddr, hang: bool, timeout: Duration) -> Self {
        StubService {
            base_url: format!("http://{addr}"),
            hang,
            timeout,
            client: reqwest::Client::new(),
        }
    }
}

impl Target for StubService {
    fn name(&self) -> &str {
        "stub"
    }

    fn kind(&self) -> TargetKind {
        TargetKind::PinningService
    }

    fn rate(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn backoff(&self) -> ExponentialBackoff {
        short_backoff()
    }

    fn as_pin(&self) -> Option<&dyn PinTarget> {
        Some(self)
    }

    fn as_cleanup(&self) -> Option<&dyn CleanupTarget> {
        Some(self)
    }
}

#[async_trait]
impl PinTarget for StubService {
    async fn pin(&self, cid: &Cid) -> Result<()> {
        let endpoint = if self.hang { "hang" } else { "pin" };
        let resp = self
            .client
            .get(format!("{}/{}/{}", self.base_url, endpoint, cid))
            .send()
            .await?;
        anyhow::ensure!(resp.status().is_success(), "status code {}", resp.status());
        Ok(())
    }
}

#[async_trait]
impl CleanupTarget for StubService {
    async fn cleanup(&self, cid: &Cid) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/cleanup/{}", self.base_url, cid))
            .send()
            .await?;
        anyhow::ensure!(resp.status().is_success(), "status code {}", resp.status());
        Ok(())
    }
}

/// An upload-style target that accepts every block without any service
/// behind it.
#[derive(Debug)]
struct StubUploader;

impl Target for StubUploader {
    fn name(&self) -> &str {
        "stub-upload"
    }

    fn kind(&self) -> TargetKind {
        TargetKind::UploadService
    }

    fn rate(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn backoff(&self) -> ExponentialBackoff {
        short_backoff()
    }

    fn as_upload(&self) -> Option<&dyn UploadTarget> {
        Some(self)
    }
}

#[async_trait]
impl UploadTarget for StubUploader {
    async fn upload(&self, block: &Block) -> Result<Cid> {
        Ok(*block.cid())
    }

    fn provider_window(&self) -> Duration {
        Duration::from_millis(500)
    }
}

fn short_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(20))
        .with_max_elapsed_time(Some(Duration::from_millis(200)))
        .build()
}

fn tracker(client: &NetworkClient, db: &Arc<MemoryPeerStore>) -> Tracker {
    Tracker::new(
        client.clone(),
        Some(db.clone() as Arc<dyn PeerStore>),
        Arc::new(GeoClient::empty()),
        Metrics::default(),
        false,
    )
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn next_path(requests: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(10), requests.recv())
        .await
        .expect("timed out waiting for a request")
        .expect("stub server gone")
}

#[tokio::test(start_paused = true)]
async fn honeypot_tracks_dht_snooper() {
    let db = Arc::new(MemoryPeerStore::new());
    let tracer = Tracer::new();
    let store = BlockStore::new();
    let (client, mut provided) = StubNode::with_public_peer().spawn();

    let probe = Probe::new(
        client.clone(),
        store.clone(),
        tracer.clone(),
        Keypair::generate_ed25519(),
        Arc::new(Honeypot::new()),
        tracker(&client, &db),
        Metrics::default(),
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn(probe.run(token.clone()));

    // the honeypot provides its content and listens
    let cid = provided.recv().await.unwrap();
    assert!(store.get(&cid).is_some());
    assert!(tracer.contains(&cid));

    // a snooping peer asks for the CID it could only have sniffed
    let snooper = PeerId::random();
    tracer.want_received(snooper, &cid);

    wait_for("tracked snooper", || db.len() == 1).await;
    let record = db.get(&snooper.to_base58(), "dummy").unwrap();
    assert_eq!(record.target_type, "honeypot");
    assert_eq!(record.target_name, "dummy");
    assert_eq!(record.multi_addresses, vec!["/ip4/1.2.3.4/tcp/4001"]);
    let first_seen = record.last_seen_at;

    // the next iteration sees the same peer again: still one row, refreshed
    let next_cid = provided.recv().await.unwrap();
    assert_ne!(next_cid, cid);
    tracer.want_received(snooper, &next_cid);
    wait_for("refreshed row", || {
        db.get(&snooper.to_base58(), "dummy")
            .map(|r| r.last_seen_at > first_seen)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(db.len(), 1);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("probe did not stop")
        .unwrap();

    // every iteration released its resources
    assert!(store.is_empty());
    assert!(tracer.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn probe_tracks_peer_that_fetches_the_cid() {
    let (addr, mut requests) = serve_stub(None).await;
    let db = Arc::new(MemoryPeerStore::new());
    let tracer = Tracer::new();
    let store = BlockStore::new();
    let (client, mut provided) = StubNode::with_public_peer().spawn();

    let probe = Probe::new(
        client.clone(),
        store.clone(),
        tracer.clone(),
        Keypair::generate_ed25519(),
        Arc::new(StubService::new(addr, false, Duration::from_secs(5))),
        tracker(&client, &db),
        Metrics::default(),
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn(probe.run(token.clone()));

    let cid = tokio::time::timeout(Duration::from_secs(10), provided.recv())
        .await
        .unwrap()
        .unwrap();

    // the service fetched its pin endpoint...
    let path = next_path(&mut requests).await;
    assert_eq!(path, format!("/pin/{cid}"));

    // ...and its fetcher peer asks for the block
    let fetcher = PeerId::random();
    tracer.want_received(fetcher, &cid);

    wait_for("tracked fetcher", || db.len() >= 1).await;
    let record = db.get(&fetcher.to_base58(), "stub").unwrap();
    assert_eq!(record.target_type, "pinning-service");
    assert!(Utc::now() - record.last_seen_at < chrono::Duration::seconds(1));

    // cleanup follows the iteration
    wait_for("cleanup request", || {
        matches!(requests.try_recv(), Ok(path) if path == format!("/cleanup/{cid}"))
    })
    .await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("probe did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_still_runs_when_the_operation_hangs() {
    let (addr, mut requests) = serve_stub(None).await;
    let db = Arc::new(MemoryPeerStore::new());
    let tracer = Tracer::new();
    let store = BlockStore::new();
    let (client, mut provided) = StubNode::with_public_peer().spawn();

    let probe = Probe::new(
        client.clone(),
        store.clone(),
        tracer.clone(),
        Keypair::generate_ed25519(),
        Arc::new(StubService::new(addr, true, Duration::from_secs(1))),
        tracker(&client, &db),
        Metrics::default(),
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn(probe.run(token.clone()));

    let cid = tokio::time::timeout(Duration::from_secs(10), provided.recv())
        .await
        .unwrap()
        .unwrap();

    // the operation hangs...
    let path = next_path(&mut requests).await;
    assert_eq!(path, format!("/hang/{cid}"));

    // ...the timeout ends the iteration, and cleanup still completes
    let path = next_path(&mut requests).await;
    assert_eq!(path, format!("/cleanup/{cid}"));

    // with the block gone and the CID unregistered
    wait_for("block deleted", || store.get(&cid).is_none()).await;
    assert!(!tracer.contains(&cid));
    assert!(db.is_empty());

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("probe did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_probe_tracks_dht_providers() {
    let db = Arc::new(MemoryPeerStore::new());

    let provider_peer = PeerId::random();
    let mut node = StubNode::with_public_peer();
    node.providers = vec![AddrInfo {
        peer_id: provider_peer,
        addrs: vec!["/ip4/5.6.7.8/tcp/4001".parse::<Multiaddr>().unwrap()],
    }];
    let (client, _provided) = node.spawn();

    let probe = UploadProbe::new(
        client.clone(),
        Keypair::generate_ed25519(),
        Arc::new(StubUploader),
        tracker(&client, &db),
        Metrics::default(),
    );

    let token = CancellationToken::new();
    let handle = tokio::spawn(probe.run(token.clone()));

    wait_for("tracked provider", || db.len() >= 1).await;
    let record = db.get(&provider_peer.to_base58(), "stub-upload").unwrap();
    assert_eq!(record.target_type, "upload-service");

    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("probe did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_fetch_roundtrips_the_payload() {
    let keypair = Keypair::generate_ed25519();
    let payload = Payload::new(&keypair).unwrap();
    let block = payload.to_block().unwrap();
    let json = String::from_utf8(payload.to_json().unwrap()).unwrap();

    let (addr, mut requests) = serve_stub(Some(json)).await;
    let gateway = Gateway::new("local", format!("http://{addr}/ipfs/{{cid}}"));

    gateway.as_pin().unwrap().pin(block.cid()).await.unwrap();
    assert_eq!(
        next_path(&mut requests).await,
        format!("/ipfs/{}", block.cid())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_rejects_bodies_that_are_not_the_payload() {
    let (addr, _requests) = serve_stub(Some("not the payload".into())).await;
    let gateway = Gateway::new("local", format!("http://{addr}/ipfs/{{cid}}"));

    let block = Block::from_v0_data(Bytes::from_static(b"x")).unwrap();
    assert!(gateway.as_pin().unwrap().pin(block.cid()).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn pinata_hits_pin_and_unpin_endpoints() {
    let (addr, mut requests) = serve_stub(None).await;
    let (client, _provided) = StubNode::with_public_peer().spawn();

    let pinata = Pinata::with_base_url(client, "token", format!("http://{addr}"));
    let block = Block::from_v0_data(Bytes::from_static(b"x")).unwrap();
    let cid = *block.cid();

    pinata.as_pin().unwrap().pin(&cid).await.unwrap();
    assert_eq!(next_path(&mut requests).await, "/pinning/pinByHash");

    pinata.as_cleanup().unwrap().cleanup(&cid).await.unwrap();
    assert_eq!(
        next_path(&mut requests).await,
        format!("/pinning/unpin/{cid}")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn web3_upload_returns_the_locally_computed_cid() {
    let keypair = Keypair::generate_ed25519();
    let block = Payload::new(&keypair).unwrap().to_raw_block().unwrap();

    let (addr, mut requests) =
        serve_stub(Some(format!("{{\"cid\":\"{}\"}}", block.cid()))).await;
    let web3 = Web3Storage::with_base_url("token", format!("http://{addr}"));

    let uploaded = web3.as_upload().unwrap().upload(&block).await.unwrap();
    assert_eq!(uploaded, *block.cid());
    assert_eq!(next_path(&mut requests).await, "/upload");
}
