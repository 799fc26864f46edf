use std::sync::Arc;

use anyhow::{Context, Result};
use cid::Cid;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::net::NetworkClient;
use crate::payload::Payload;
use crate::store::BlockStore;
use crate::target::Target;
use crate::throttle::Throttle;
use crate::tracer::Tracer;
use crate::tracking::Tracker;
use crate::utils::{self, Cancelled};

pub mod upload;

pub use upload::UploadProbe;

/// Probes a single gateway, pinning service or honeypot target.
///
/// Each iteration publishes fresh content, nudges the target to fetch it and
/// waits for the tracer to report which peer asked for it.
pub struct Probe {
    client: NetworkClient,
    store: BlockStore,
    tracer: Tracer,
    keypair: Keypair,
    target: Arc<dyn Target>,
    tracker: Tracker,
    metrics: Metrics,
    probe_count: u64,
    track_count: u64,
}

impl Probe {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: NetworkClient,
        store: BlockStore,
        tracer: Tracer,
        keypair: Keypair,
        target: Arc<dyn Target>,
        tracker: Tracker,
        metrics: Metrics,
    ) -> Self {
        Probe {
            client,
            store,
            tracer,
            keypair,
            target,
            tracker,
            metrics,
            probe_count: 0,
            track_count: 0,
        }
    }

    /// Runs the rate-gated probe loop until the token is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let name = self.target.name().to_string();
        let kind = self.target.kind();
        let mut throttle = Throttle::new(1, self.target.rate());

        loop {
            // cancellation takes precedence over a ready lease
            if token.is_cancelled() {
                return;
            }

            debug!(%name, %kind, rate = ?self.target.rate(), "awaiting probe lease");
            tokio::select! {
                _ = token.cancelled() => return,
                lease = throttle.recv() => {
                    if lease.is_none() {
                        return;
                    }
                }
            }

            match self.probe_target(&token).await {
                Ok(()) => {}
                Err(err) if utils::is_cancellation(&err) || token.is_cancelled() => return,
                Err(err) => warn!(%name, %kind, "error probing target: {err:#}"),
            }
        }
    }

    /// One probe iteration. Whatever path exits it, the block is deleted
    /// from the store, the CID is unregistered from the tracer and cleanup
    /// (if the target supports it) has run.
    async fn probe_target(&mut self, token: &CancellationToken) -> Result<()> {
        self.probe_count += 1;
        self.metrics.record_probe(self.target.as_ref());

        let payload = Payload::new(&self.keypair).context("new payload data")?;
        let block = payload.to_block().context("payload bytes")?;
        let cid = *block.cid();

        info!(name = self.target.name(), %cid, "generated content");
        self.store.put(block);
        let mut sightings = self.tracer.register(&cid);
        let _scope = IterationScope {
            store: self.store.clone(),
            tracer: self.tracer.clone(),
            cid,
        };

        let provided = tokio::select! {
            _ = token.cancelled() => Err(Cancelled.into()),
            res = self.client.provide(cid) => res,
        };
        provided.context("dht provide content")?;

        let outcome = self.observe(token, cid, &mut sightings).await;

        if self.target.as_cleanup().is_some() {
            run_cleanup(self.target.as_ref(), token, cid).await;
        }

        outcome
    }

    /// Drives the target operation and waits for a sighting, whichever
    /// happens first within the target's timeout.
    async fn observe(
        &mut self,
        token: &CancellationToken,
        cid: Cid,
        sightings: &mut mpsc::Receiver<PeerId>,
    ) -> Result<()> {
        let op_token = token.child_token();

        let observed = {
            let operation = self.run_operation(op_token.clone(), cid);
            tokio::pin!(operation);
            let deadline = time::sleep(self.target.timeout());
            tokio::pin!(deadline);

            tokio::select! {
                maybe_peer = sightings.recv() => maybe_peer,
                _ = &mut deadline => None,
                _ = op_token.cancelled() => None,
                _ = &mut operation => None,
            }
        };
        // stop a still-running operation before leaving the iteration
        op_token.cancel();

        match observed {
            Some(peer_id) => {
                info!(name = self.target.name(), peer = %peer_id, "tracking peer that requested cid");
                self.track_count += 1;
                self.tracker
                    .track_peer(peer_id, self.target.as_ref())
                    .await
            }
            None if token.is_cancelled() => Err(Cancelled.into()),
            None => Ok(()),
        }
    }

    /// Runs the target's pin operation under its backoff policy. Never
    /// resolves: a successful operation keeps the iteration waiting for a
    /// sighting, a permanently failed one cancels the iteration's token.
    async fn run_operation(&self, op_token: CancellationToken, cid: Cid) {
        if let Some(pin) = self.target.as_pin() {
            info!(name = self.target.name(), %cid, "starting probe operation");

            let result = backoff::future::retry_notify(
                self.target.backoff(),
                || async { pin.pin(&cid).await.map_err(backoff::Error::transient) },
                |err, dur| {
                    debug!(name = self.target.name(), ?dur, "probe operation failed: {err:#}")
                },
            )
            .await;

            match result {
                Ok(()) => debug!(name = self.target.name(), %cid, "probe operation complete"),
                Err(err) => {
                    if !op_token.is_cancelled() {
                        info!(name = self.target.name(), "probe operation failed: {err:#}");
                        op_token.cancel();
                    }
                }
            }
        }

        // targets without an operation (the honeypot) just listen
        std::future::pending::<()>().await;
    }
}

/// Deletes the iteration's block and tracer registration on every exit path.
struct IterationScope {
    store: BlockStore,
    tracer: Tracer,
    cid: Cid,
}

impl Drop for IterationScope {
    fn drop(&mut self) {
        self.tracer.unregister(&self.cid);
        self.store.delete(&self.cid);
    }
}

/// Releases a target's external resources, retrying under the target's
/// backoff. Runs on the outer token so it can outlive an iteration timeout;
/// only a shutdown stops the retries.
pub(crate) async fn run_cleanup(target: &dyn Target, token: &CancellationToken, cid: Cid) {
    let Some(cleanup) = target.as_cleanup() else {
        warn!(
            name = target.name(),
            %cid,
            "target does not support cleanup, release the content manually"
        );
        return;
    };

    let retried = backoff::future::retry(target.backoff(), || async {
        cleanup.cleanup(&cid).await.map_err(backoff::Error::transient)
    });

    tokio::select! {
        biased;
        res = retried => {
            if let Err(err) = res {
                warn!(name = target.name(), %cid, "error cleaning up resources: {err:#}");
            }
        }
        _ = token.cancelled() => {
            debug!(name = target.name(), %cid, "cleanup cut short by shutdown");
        }
    }
}
