// Axum request handlers: translate player HTTP requests into gateway streams.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::Stream;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::gateway::{Disposition, PreparedStream, StreamingGateway};
use super::status::{bandwidth_handler, health_handler};
use crate::engine::governor::BandwidthGovernor;
use crate::engine::streamer::ChunkStream;
use crate::error::{GatewayError, GatewayResult};
use crate::handle::FileHandle;

pub type SharedGateway = Arc<StreamingGateway>;

pub fn router(gateway: SharedGateway) -> Router {
    Router::new()
        .route("/stream/{handle}", get(stream_handler).head(stream_head_handler))
        .route("/dl/{handle}", get(download_handler).head(download_head_handler))
        .route("/bandwidth", get(bandwidth_handler))
        .route("/health", get(health_handler))
        .with_state(gateway)
}

pub struct GatewayServer {
    addr: SocketAddr,
    gateway: SharedGateway,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl GatewayServer {
    /// Start the gateway on a random local port, returning a handle.
    pub async fn start(gateway: SharedGateway) -> Result<Self> {
        Self::bind(gateway, "127.0.0.1:0").await
    }

    pub async fn bind(gateway: SharedGateway, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(Arc::clone(&gateway));

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!("gateway listening on {}", addr);
        Ok(Self {
            addr,
            gateway,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build a URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.gateway
    }

    /// Stop accepting connections and tear down the gateway.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.gateway.shutdown().await;
    }
}

/// GET /stream/{handle}
async fn stream_handler(
    State(gateway): State<SharedGateway>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve(gateway, handle, headers, Disposition::Inline).await
}

/// GET /dl/{handle}
async fn download_handler(
    State(gateway): State<SharedGateway>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve(gateway, handle, headers, Disposition::Attachment).await
}

async fn stream_head_handler(
    State(gateway): State<SharedGateway>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Response {
    head(gateway, handle, headers, Disposition::Inline).await
}

async fn download_head_handler(
    State(gateway): State<SharedGateway>,
    Path(handle): Path<String>,
    headers: HeaderMap,
) -> Response {
    head(gateway, handle, headers, Disposition::Attachment).await
}

/// A Range header that is present but not ASCII is treated as malformed.
fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::RANGE)
        .map(|v| v.to_str().unwrap_or_default())
}

async fn serve(
    gateway: SharedGateway,
    handle: String,
    headers: HeaderMap,
    disposition: Disposition,
) -> Response {
    let range = range_header(&headers);
    debug!("{} request handle={} range={:?}", disposition, handle, range);

    match gateway.open(&handle, range, disposition).await {
        Ok(prepared) => into_streaming_response(prepared, gateway.governor()),
        Err(e) => error_response(&handle, e),
    }
}

async fn head(
    gateway: SharedGateway,
    handle: String,
    headers: HeaderMap,
    disposition: Disposition,
) -> Response {
    match gateway
        .describe(&handle, range_header(&headers), disposition)
        .await
    {
        Ok(head) => (head.status, head.headers).into_response(),
        Err(e) => error_response(&handle, e),
    }
}

fn error_response(handle: &str, e: GatewayError) -> Response {
    match &e {
        GatewayError::NotFound | GatewayError::RangeNotSatisfiable { .. } => {
            debug!("request for {} rejected: {}", handle, e)
        }
        GatewayError::QuotaExceeded | GatewayError::Cancelled => {
            warn!("request for {} refused: {}", handle, e)
        }
        _ => error!("request for {} failed: {}", handle, e),
    }
    e.into_response()
}

fn into_streaming_response(prepared: PreparedStream, governor: &Arc<BandwidthGovernor>) -> Response {
    let PreparedStream { head, handle, body } = prepared;
    let body = match body {
        Some(stream) => Body::from_stream(MeteredBody::new(
            stream,
            Arc::clone(governor),
            handle,
            head.content_length,
        )),
        None => Body::empty(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

/// Response body that counts the bytes handed to the connection and records
/// them with the governor once the body is finished or dropped.
pub struct MeteredBody {
    inner: ChunkStream,
    governor: Arc<BandwidthGovernor>,
    handle: FileHandle,
    planned: u64,
    written: u64,
    failed: bool,
}

impl MeteredBody {
    pub fn new(
        inner: ChunkStream,
        governor: Arc<BandwidthGovernor>,
        handle: FileHandle,
        planned: u64,
    ) -> Self {
        governor.stream_started();
        Self {
            inner,
            governor,
            handle,
            planned,
            written: 0,
            failed: false,
        }
    }
}

impl Stream for MeteredBody {
    type Item = GatewayResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.written += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.failed = true;
                error!(
                    "stream of {} aborted after {} of {} bytes: {}",
                    self.handle, self.written, self.planned, e
                );
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.governor.stream_finished();
        let written = self.written;
        if written == self.planned {
            debug!("stream of {} complete ({} bytes)", self.handle, written);
        } else if !self.failed {
            info!(
                "client left {} after {} of {} bytes",
                self.handle, written, self.planned
            );
        }

        let governor = Arc::clone(&self.governor);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    governor.record(written).await;
                });
            }
            Err(_) => warn!("no runtime to record {} bytes served", written),
        }
    }
}
