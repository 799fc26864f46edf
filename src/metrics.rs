use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper::{Request, Response};
use prometheus_client::encoding::text::{encode, Encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::target::Target;

type BytesBody = http_body_util::Full<hyper::body::Bytes>;

/// Labels shared by all probe metrics.
#[derive(Clone, Hash, PartialEq, Eq, Encode)]
pub struct TargetLabels {
    pub target_name: String,
    pub target_type: String,
}

impl TargetLabels {
    pub fn for_target(target: &dyn Target) -> Self {
        TargetLabels {
            target_name: target.name().to_string(),
            target_type: target.kind().as_str().to_string(),
        }
    }
}

/// Probe engine counters, exported as `antares_probe_count` and
/// `antares_track_count`.
#[derive(Clone, Default)]
pub struct Metrics {
    probe_count: Family<TargetLabels, Counter>,
    track_count: Family<TargetLabels, Counter>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let sub_registry = registry.sub_registry_with_prefix("antares");

        let probe_count = Family::<TargetLabels, Counter>::default();
        sub_registry.register(
            "probe_count",
            "Number of probes performed",
            Box::new(probe_count.clone()),
        );

        let track_count = Family::<TargetLabels, Counter>::default();
        sub_registry.register(
            "track_count",
            "Number of tracked peers",
            Box::new(track_count.clone()),
        );

        Metrics {
            probe_count,
            track_count,
        }
    }

    pub fn record_probe(&self, target: &dyn Target) {
        self.probe_count
            .get_or_create(&TargetLabels::for_target(target))
            .inc();
    }

    pub fn record_track(&self, target: &dyn Target) {
        self.track_count
            .get_or_create(&TargetLabels::for_target(target))
            .inc();
    }
}

/// Serves the OpenMetrics encoding of the registry at `/metrics`.
pub async fn serve(registry: Registry, addr: SocketAddr) -> Result<()> {
    info!("starting metrics server on {addr}");
    let registry = Arc::new(registry);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics on {addr}"))?;

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |req| handler(req, registry.clone())),
                )
                .await
            {
                error!("error serving metrics connection: {err:#}");
            }
        });
    }
}

async fn handler(
    _req: Request<hyper::body::Incoming>,
    registry: Arc<Registry>,
) -> Result<Response<BytesBody>> {
    let mut buf = Vec::new();
    encode(&mut buf, &registry).context("encode metrics")?;

    Response::builder()
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(http_body_util::Full::new(buf.into()))
        .context("failed to build response")
}

#[cfg(test)]
mod tests {
    use crate::target::Honeypot;

    use super::*;

    #[test]
    fn counters_show_up_in_the_encoding() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);

        let target = Honeypot::new();
        metrics.record_probe(&target);
        metrics.record_probe(&target);
        metrics.record_track(&target);

        let mut buf = Vec::new();
        encode(&mut buf, &registry).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("antares_probe_count"));
        assert!(text.contains("antares_track_count"));
        assert!(text.contains("target_name=\"dummy\""));
        assert!(text.contains("target_type=\"honeypot\""));
    }
}
