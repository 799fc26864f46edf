use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use prost::Message as _;
use tokio::net::TcpListener;
use tracing::{error, info};

type BytesBody = http_body_util::Full<hyper::body::Bytes>;

const DEFAULT_SECONDS: u64 = 30;
const MAX_SECONDS: u64 = 5 * 60;
const SAMPLE_FREQUENCY: i32 = 100;

/// Serves CPU profiles in pprof format, standing in for Go's
/// `net/http/pprof` endpoint. Any request produces a profile over the
/// `seconds` query parameter's duration.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    info!("starting profiling endpoint on {addr}");

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind pprof on {addr}"))?;

    loop {
        let (stream, _addr) = listener.accept().await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                error!("error serving pprof connection: {err:#}");
            }
        });
    }
}

async fn handler(req: Request<hyper::body::Incoming>) -> Result<Response<BytesBody>> {
    let seconds = req
        .uri()
        .query()
        .and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("seconds="))
        })
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_SECONDS)
        .min(MAX_SECONDS);

    match profile(Duration::from_secs(seconds)).await {
        Ok(body) => Response::builder()
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .body(http_body_util::Full::new(body.into()))
            .context("failed to build response"),
        Err(err) => {
            error!("profiling failed: {err:#}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(http_body_util::Full::new(format!("{err:#}").into()))
                .context("failed to build response")
        }
    }
}

async fn profile(duration: Duration) -> Result<Vec<u8>> {
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(SAMPLE_FREQUENCY)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("start profiler")?;

    tokio::time::sleep(duration).await;

    let profile = guard
        .report()
        .build()
        .context("build profile report")?
        .pprof()
        .context("encode pprof profile")?;

    Ok(profile.encode_to_vec())
}
