use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use cid::Cid;
use tracing::{debug, info};

use crate::payload::Payload;

use super::{exponential_backoff, substitute_cid, PinTarget, Target, TargetKind};

/// A public HTTP gateway, probed by asking it to resolve our freshly
/// provided CID.
#[derive(Debug)]
pub struct Gateway {
    name: String,
    url_template: String,
    client: reqwest::Client,
}

impl Gateway {
    /// `url_template` must contain the `{cid}` token, e.g.
    /// `https://ipfs.io/ipfs/{cid}`.
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Gateway {
            name: name.into(),
            url_template: url_template.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Target for Gateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Gateway
    }

    fn rate(&self) -> Duration {
        Duration::from_secs(2 * 60)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(11 * 60)
    }

    fn backoff(&self) -> ExponentialBackoff {
        exponential_backoff(
            Duration::from_secs(30),
            0.5,
            1.2,
            Duration::from_secs(2 * 60),
            Duration::from_secs(10 * 60),
        )
    }

    fn as_pin(&self) -> Option<&dyn PinTarget> {
        Some(self)
    }
}

#[async_trait]
impl PinTarget for Gateway {
    async fn pin(&self, cid: &Cid) -> Result<()> {
        let url = substitute_cid(&self.url_template, cid);
        info!(name = self.name, %cid, url, "requesting cid from gateway");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("gateway request")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("status code {}", status.as_u16()));
        }

        let body = resp.bytes().await.context("read gateway response body")?;
        let payload: Payload =
            serde_json::from_slice(&body).context("parse gateway response")?;
        debug!(
            name = self.name,
            msg = payload.message,
            ts = %payload.timestamp,
            "fetched probe data"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_shape() {
        let gw = Gateway::new("ipfs.io", "https://ipfs.io/ipfs/{cid}");
        assert_eq!(gw.name(), "ipfs.io");
        assert_eq!(gw.kind(), TargetKind::Gateway);
        assert!(gw.as_pin().is_some());
        assert!(gw.as_cleanup().is_none());
        assert!(gw.as_upload().is_none());
    }
}
