use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use cid::Cid;
use iroh_bitswap::Block;

mod gateway;
mod honeypot;
mod infura;
mod pinata;
mod web3;

pub use gateway::Gateway;
pub use honeypot::Honeypot;
pub use infura::{Infura, INFURA_TARGET_NAME};
pub use pinata::{Pinata, PINATA_TARGET_NAME};
pub use web3::{Web3Storage, WEB3_TARGET_NAME};

/// Placeholder in gateway URL templates that is replaced with the probe CID.
pub const GATEWAY_URL_CID_TOKEN: &str = "{cid}";

/// What kind of service a target is. The tag ends up in log lines, metric
/// labels and the persisted peer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Gateway,
    PinningService,
    UploadService,
    Honeypot,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Gateway => "gateway",
            TargetKind::PinningService => "pinning-service",
            TargetKind::UploadService => "upload-service",
            TargetKind::Honeypot => "honeypot",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external service the probe engine exercises.
///
/// Targets differ in how they can be made to touch our content. The always
/// present part is identity and pacing; the interaction styles are optional
/// capabilities a probe loop queries for. A target exposing none of them
/// (the honeypot) just publishes and listens.
pub trait Target: Send + Sync + fmt::Debug {
    /// Logical name, e.g. `ipfs.io` or `pinata`.
    fn name(&self) -> &str;

    fn kind(&self) -> TargetKind;

    /// Minimum interval between two probes of this target.
    fn rate(&self) -> Duration;

    /// How long a single probe waits for an observation.
    fn timeout(&self) -> Duration;

    /// Retry policy for the target's side-effecting operations.
    fn backoff(&self) -> ExponentialBackoff;

    fn as_pin(&self) -> Option<&dyn PinTarget> {
        None
    }

    fn as_upload(&self) -> Option<&dyn UploadTarget> {
        None
    }

    fn as_cleanup(&self) -> Option<&dyn CleanupTarget> {
        None
    }
}

/// Targets that fetch or pin a CID we have already provided on the DHT.
#[async_trait]
pub trait PinTarget: Target {
    async fn pin(&self, cid: &Cid) -> Result<()>;
}

/// Targets that receive the content bytes directly and report the CID back.
#[async_trait]
pub trait UploadTarget: Target {
    async fn upload(&self, block: &Block) -> Result<Cid>;

    /// How long after the upload the service can be expected to show up in
    /// the DHT provider records. Services re-announce on their own schedule,
    /// so this is a per-target knob rather than a protocol constant.
    fn provider_window(&self) -> Duration {
        self.timeout()
    }
}

/// Targets that can release external resources a probe created.
#[async_trait]
pub trait CleanupTarget: Target {
    async fn cleanup(&self, cid: &Cid) -> Result<()>;
}

/// Exponential backoff in the shape all targets use: randomized, capped, and
/// bounded in total elapsed time.
pub(crate) fn exponential_backoff(
    initial: Duration,
    randomization_factor: f64,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Duration,
) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_randomization_factor(randomization_factor)
        .with_multiplier(multiplier)
        .with_max_interval(max_interval)
        .with_max_elapsed_time(Some(max_elapsed))
        .build()
}

/// Substitutes the CID into a gateway URL template.
pub(crate) fn substitute_cid(url_template: &str, cid: &Cid) -> String {
    url_template.replace(GATEWAY_URL_CID_TOKEN, &cid.to_string())
}
