use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use cid::Cid;
use iroh_bitswap::Block;
use serde::Deserialize;
use tracing::{debug, info};

use super::{exponential_backoff, Target, TargetKind, UploadTarget};

pub const WEB3_TARGET_NAME: &str = "web3";

const DEFAULT_BASE_URL: &str = "https://api.web3.storage";

/// Web3.Storage, probed by uploading the content bytes directly.
///
/// The service becomes a DHT provider for the uploaded CID on its own
/// schedule, so the probe discovers its peers through provider records
/// rather than through bitswap.
#[derive(Debug)]
pub struct Web3Storage {
    auth: String,
    base_url: String,
    provider_window: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    cid: String,
    #[serde(default)]
    #[allow(dead_code)]
    car_cid: Option<String>,
}

impl Web3Storage {
    pub fn new(auth: impl Into<String>) -> Self {
        Self::with_base_url(auth, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(auth: impl Into<String>, base_url: impl Into<String>) -> Self {
        Web3Storage {
            auth: auth.into(),
            base_url: base_url.into(),
            provider_window: Duration::from_secs(10 * 60),
            client: reqwest::Client::new(),
        }
    }

    /// Overrides how long the probe watches the DHT for the service's
    /// provider records after an upload.
    pub fn with_provider_window(mut self, window: Duration) -> Self {
        self.provider_window = window;
        self
    }
}

impl Target for Web3Storage {
    fn name(&self) -> &str {
        WEB3_TARGET_NAME
    }

    fn kind(&self) -> TargetKind {
        TargetKind::UploadService
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

    fn as_upload(&self) -> Option<&dyn UploadTarget> {
        Some(self)
    }
}

#[async_trait]
impl UploadTarget for Web3Storage {
    async fn upload(&self, block: &Block) -> Result<Cid> {
        info!(name = self.name(), cid = %block.cid(), "uploading content to web3.storage");

        let resp = self
            .client
            .post(format!("{}/upload", self.base_url))
            .bearer_auth(&self.auth)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(block.data().to_vec())
            .send()
            .await
            .context("upload content to web3.storage")?;

        let status = resp.status();
        let body = resp.text().await.context("read upload response body")?;
        debug!(name = self.name(), body, "upload response");

        if !status.is_success() {
            return Err(anyhow!("status code {}", status.as_u16()));
        }

        let parsed: UploadResponse =
            serde_json::from_str(&body).context("parse upload response")?;
        parsed.cid.parse().context("parse cid")
    }

    fn provider_window(&self) -> Duration {
        self.provider_window
    }
}
