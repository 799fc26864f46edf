use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cid::Cid;
use libp2p::identity::Keypair;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::net::{AddrInfo, NetworkClient};
use crate::payload::Payload;
use crate::target::Target;
use crate::throttle::Throttle;
use crate::tracking::Tracker;
use crate::utils::{self, Cancelled};

use super::run_cleanup;

/// How many provider records to resolve per probe.
const PROVIDER_LIMIT: usize = 10;

/// Probes an upload service.
///
/// Upload services receive the content bytes directly, so there is nothing
/// for them to fetch over bitswap. Instead they become DHT providers for the
/// uploaded CID, and the probe discovers their peers through the provider
/// records.
pub struct UploadProbe {
    client: NetworkClient,
    keypair: Keypair,
    target: Arc<dyn Target>,
    tracker: Tracker,
    metrics: Metrics,
    probe_count: u64,
    track_count: u64,
}

impl UploadProbe {
    pub fn new(
        client: NetworkClient,
        keypair: Keypair,
        target: Arc<dyn Target>,
        tracker: Tracker,
        metrics: Metrics,
    ) -> Self {
        UploadProbe {
            client,
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

    async fn probe_target(&mut self, token: &CancellationToken) -> Result<()> {
        self.probe_count += 1;
        self.metrics.record_probe(self.target.as_ref());

        let payload = Payload::new(&self.keypair).context("new payload data")?;
        let block = payload.to_raw_block().context("payload bytes")?;
        let cid = *block.cid();

        // upload under backoff, bounded by the target timeout
        let (uploaded, window) = {
            let upload = self
                .target
                .as_upload()
                .context("target does not support upload")?;

            info!(name = self.target.name(), %cid, "starting probe operation");
            let uploaded: Result<Option<Cid>> = tokio::select! {
                _ = token.cancelled() => Err(Cancelled.into()),
                res = time::timeout(
                    self.target.timeout(),
                    backoff::future::retry_notify(
                        self.target.backoff(),
                        || async { upload.upload(&block).await.map_err(backoff::Error::transient) },
                        |err, dur| {
                            debug!(name = self.target.name(), ?dur, "probe operation failed: {err:#}")
                        },
                    ),
                ) => match res {
                    Ok(inner) => inner.map(Some).context("upload content"),
                    Err(_) => {
                        info!(name = self.target.name(), %cid, "probe operation timed out");
                        Ok(None)
                    }
                },
            };

            (uploaded, upload.provider_window())
        };

        let outcome = match uploaded {
            Err(err) => Err(err),
            Ok(None) => Ok(()),
            Ok(Some(service_cid)) => self.observe(token, cid, service_cid, window).await,
        };

        // release external resources no matter how the observation went
        run_cleanup(self.target.as_ref(), token, cid).await;

        outcome
    }

    /// Verifies the service-reported CID and tracks every DHT provider that
    /// shows up for it within the window.
    async fn observe(
        &mut self,
        token: &CancellationToken,
        cid: Cid,
        service_cid: Cid,
        window: Duration,
    ) -> Result<()> {
        if service_cid != cid {
            bail!("service reported cid {service_cid}, expected {cid}");
        }

        // the service re-announces on its own schedule, so give the DHT the
        // configured window to surface its provider records
        let providers =
            match time::timeout(window, self.client.find_providers(cid, PROVIDER_LIMIT)).await {
                Ok(providers) => providers.context("find providers")?,
                Err(_) => {
                    debug!(name = self.target.name(), %cid, "no providers within the window");
                    Vec::new()
                }
            };

        for provider in providers {
            if token.is_cancelled() {
                return Err(Cancelled.into());
            }
            info!(name = self.target.name(), peer = %provider.peer_id, "found provider");
            if let Err(err) = self.track_provider(provider).await {
                warn!(name = self.target.name(), "error tracking provider: {err:#}");
            }
        }

        Ok(())
    }

    async fn track_provider(&mut self, provider: AddrInfo) -> Result<()> {
        self.track_count += 1;

        self.client
            .connect(provider.clone())
            .await
            .context("connect to provider")?;

        self.tracker
            .track_peer(provider.peer_id, self.target.as_ref())
            .await
    }
}
