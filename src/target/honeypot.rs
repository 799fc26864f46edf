use std::time::Duration;

use backoff::ExponentialBackoff;

use super::{Target, TargetKind};

/// Detects peers that snoop on DHT traffic.
///
/// The honeypot exposes no operation at all: its content is provided and then
/// nobody is asked to fetch it. Any peer that still wants the CID can only
/// have learned it by watching provider announcements.
#[derive(Debug, Default)]
pub struct Honeypot;

impl Honeypot {
    pub fn new() -> Self {
        Honeypot
    }
}

impl Target for Honeypot {
    fn name(&self) -> &str {
        "dummy"
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Honeypot
    }

    fn rate(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::default()
    }
}
