use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use cid::Cid;
use tracing::{debug, info};

use super::{exponential_backoff, CleanupTarget, PinTarget, Target, TargetKind};

pub const INFURA_TARGET_NAME: &str = "infura";

const DEFAULT_BASE_URL: &str = "https://ipfs.infura.io:5001";

/// Infura's IPFS API, probed through its pin endpoints. Authenticates with
/// HTTP basic auth; the configured authorization is `<user>,<password>`.
#[derive(Debug)]
pub struct Infura {
    username: String,
    password: String,
    base_url: String,
    client: reqwest::Client,
}

impl Infura {
    pub fn new(auth: &str) -> Result<Self> {
        Self::with_base_url(auth, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(auth: &str, base_url: impl Into<String>) -> Result<Self> {
        let Some((username, password)) = auth.split_once(',') else {
            bail!("malformed infura credentials");
        };

        Ok(Infura {
            username: username.to_string(),
            password: password.to_string(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        })
    }

    async fn pin_request(&self, endpoint: &str, cid: &Cid) -> Result<()> {
        let resp = self
            .client
            .post(format!(
                "{}/api/v0/pin/{}?arg=/ipfs/{}",
                self.base_url, endpoint, cid
            ))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .context("infura pin request")?;

        let status = resp.status();
        let body = resp.text().await.context("read infura response body")?;
        debug!(name = self.name(), body, "infura response");

        if !status.is_success() {
            return Err(anyhow!("status code {}", status.as_u16()));
        }

        Ok(())
    }
}

impl Target for Infura {
    fn name(&self) -> &str {
        INFURA_TARGET_NAME
    }

    fn kind(&self) -> TargetKind {
        TargetKind::PinningService
    }

    fn rate(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn backoff(&self) -> ExponentialBackoff {
        exponential_backoff(
            Duration::from_secs(5),
            0.5,
            1.5,
            Duration::from_secs(2 * 60),
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
impl PinTarget for Infura {
    async fn pin(&self, cid: &Cid) -> Result<()> {
        info!(name = self.name(), %cid, "pinning cid to infura");
        self.pin_request("add", cid).await
    }
}

#[async_trait]
impl CleanupTarget for Infura {
    async fn cleanup(&self, cid: &Cid) -> Result<()> {
        info!(name = self.name(), %cid, "unpinning cid from infura");
        self.pin_request("rm", cid).await
    }
}
