use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::Utc;
use cid::Cid;
use serde::Serialize;
use tracing::{debug, info};

use crate::net::NetworkClient;
use crate::utils;

use super::{exponential_backoff, CleanupTarget, PinTarget, Target, TargetKind};

pub const PINATA_TARGET_NAME: &str = "pinata";

const DEFAULT_BASE_URL: &str = "https://api.pinata.cloud";

/// Pinata, probed through its pin-by-hash API.
///
/// The pin request advertises our own public multiaddr as a preferred host
/// node so Pinata's fetcher comes straight to us instead of walking the DHT.
#[derive(Debug)]
pub struct Pinata {
    network: NetworkClient,
    auth: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PinataRequest {
    hash_to_pin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pinata_metadata: Option<PinataMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pinata_options: Option<PinataOptions>,
}

#[derive(Debug, Serialize)]
struct PinataMetadata {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PinataOptions {
    host_nodes: Vec<String>,
}

impl Pinata {
    pub fn new(network: NetworkClient, auth: impl Into<String>) -> Self {
        Self::with_base_url(network, auth, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        network: NetworkClient,
        auth: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Pinata {
            network,
            auth: auth.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Our first publicly reachable address, with the peer id appended the
    /// way Pinata expects host nodes to be given.
    async fn host_node(&self) -> Option<String> {
        let addrs = self.network.addrs().await.ok()?;
        let public = addrs.into_iter().find(utils::is_public_maddr)?;
        Some(format!("{}/p2p/{}", public, self.network.local_peer_id()))
    }
}

impl Target for Pinata {
    fn name(&self) -> &str {
        PINATA_TARGET_NAME
    }

    fn kind(&self) -> TargetKind {
        TargetKind::PinningService
    }

    fn rate(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    fn backoff(&self) -> ExponentialBackoff {
        exponential_backoff(
            Duration::from_secs(60),
            0.5,
            1.2,
            Duration::from_secs(5 * 60),
            Duration::from_secs(10 * 60),
        )
    }

    fn as_pin(&self) -> Option<&dyn PinTarget> {
        Some(self)
    }

    fn as_cleanup(&self) -> Option<&dyn CleanupTarget> {
        Some(self)
    }
}

#[async_trait]
impl PinTarget for Pinata {
    async fn pin(&self, cid: &Cid) -> Result<()> {
        info!(name = self.name(), %cid, "pinning cid to pinata");

        let host_nodes = self.host_node().await.map(|node| PinataOptions {
            host_nodes: vec![node],
        });
        let request = PinataRequest {
            hash_to_pin: cid.to_string(),
            pinata_metadata: Some(PinataMetadata {
                name: format!("Antares {}", Utc::now()),
            }),
            pinata_options: host_nodes,
        };

        let resp = self
            .client
            .post(format!("{}/pinning/pinByHash", self.base_url))
            .bearer_auth(&self.auth)
            .json(&request)
            .send()
            .await
            .context("pin cid to pinata")?;

        let status = resp.status();
        let body = resp.text().await.context("read pin response body")?;
        debug!(name = self.name(), body, "pin response");

        if !status.is_success() {
            return Err(anyhow!("status code {}", status.as_u16()));
        }

        Ok(())
    }
}

#[async_trait]
impl CleanupTarget for Pinata {
    async fn cleanup(&self, cid: &Cid) -> Result<()> {
        info!(name = self.name(), %cid, "unpinning cid from pinata");

        let resp = self
            .client
            .delete(format!("{}/pinning/unpin/{}", self.base_url, cid))
            .bearer_auth(&self.auth)
            .send()
            .await
            .context("unpin cid from pinata")?;

        let status = resp.status();
        let body = resp.text().await.context("read unpin response body")?;
        debug!(name = self.name(), body, "unpin response");

        if !status.is_success() {
            return Err(anyhow!("status code {}", status.as_u16()));
        }

        Ok(())
    }
}
