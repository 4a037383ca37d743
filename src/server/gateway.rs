// Streaming gateway: per-request flow from handle to committed response head and body stream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::range::resolve_range;
use crate::config::{GatewayConfig, SettingsProvider};
use crate::detect::mime::content_type_for;
use crate::engine::cache::{DescriptorCache, FileDescriptor};
use crate::engine::governor::BandwidthGovernor;
use crate::engine::planner::RangePlan;
use crate::engine::session::ShardSessionManager;
use crate::engine::streamer::{ChunkStream, ChunkStreamer, RateLimitPolicy};
use crate::error::{GatewayError, GatewayResult};
use crate::handle::{FileHandle, LinkBuilder};
use crate::source::traits::BackendTransport;
use crate::store::MetadataStore;

/// Whether the client should play the file or save it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("stream"),
            Self::Attachment => f.write_str("download"),
        }
    }
}

/// Status line and headers of a response, decided before any body byte.
#[derive(Debug)]
pub struct StreamHead {
    pub status: StatusCode,
    pub content_length: u64,
    pub headers: HeaderMap,
}

/// A response ready to be written: the head plus the lazy body, if any.
pub struct PreparedStream {
    pub head: StreamHead,
    pub handle: FileHandle,
    pub body: Option<ChunkStream>,
}

pub struct StreamingGateway {
    store: Arc<dyn MetadataStore>,
    cache: Arc<DescriptorCache>,
    sessions: Arc<ShardSessionManager>,
    streamer: ChunkStreamer,
    governor: Arc<BandwidthGovernor>,
    settings: Arc<dyn SettingsProvider>,
    links: LinkBuilder,
    cache_max_age_secs: u64,
    shutdown: CancellationToken,
}

impl StreamingGateway {
    pub fn new(
        config: &GatewayConfig,
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn BackendTransport>,
        settings: Arc<dyn SettingsProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        let sessions = Arc::new(ShardSessionManager::new(
            transport,
            config.streaming.auth_import_attempts,
        ));
        let streamer = ChunkStreamer::new(
            Arc::clone(&sessions),
            RateLimitPolicy::from_config(&config.streaming),
            shutdown.child_token(),
        );
        Self {
            cache: Arc::new(DescriptorCache::new(Arc::clone(&store))),
            sessions,
            streamer,
            governor: Arc::new(BandwidthGovernor::new(Arc::clone(&store), Arc::clone(&settings))),
            store,
            settings,
            links: LinkBuilder::new(&config.server.base_url),
            cache_max_age_secs: config.server.cache_max_age_secs,
            shutdown,
        }
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<ShardSessionManager> {
        &self.sessions
    }

    pub fn governor(&self) -> &Arc<BandwidthGovernor> {
        &self.governor
    }

    pub fn links(&self) -> &LinkBuilder {
        &self.links
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Start the descriptor cache flush timer. Stops on shutdown.
    pub fn spawn_janitor(&self, every: Duration) -> JoinHandle<()> {
        Arc::clone(&self.cache).spawn_janitor(every, self.shutdown.child_token())
    }

    /// Abort in-flight fetch loops and close every shard session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.shutdown().await;
        debug!("streaming gateway stopped");
    }

    /// Resolve, admit, validate and start streaming one request.
    ///
    /// Every error returned here happens before the response is committed.
    pub async fn open(
        &self,
        raw_handle: &str,
        range: Option<&str>,
        disposition: Disposition,
    ) -> GatewayResult<PreparedStream> {
        let descriptor = self.resolve(raw_handle).await?;

        if !self.governor.admit().await {
            return Err(GatewayError::QuotaExceeded);
        }

        let interval = resolve_range(range, descriptor.size_bytes)?;
        let head = self.head_for(&descriptor, interval, disposition);

        let size = descriptor.size_bytes;
        let chunk_size = self.settings.chunk_size();
        let plan = match interval {
            Some((from, until)) => RangePlan::new(from, until, size, chunk_size)?,
            None if size == 0 => {
                self.count_download(&descriptor.handle);
                return Ok(PreparedStream {
                    head,
                    handle: descriptor.handle.clone(),
                    body: None,
                });
            }
            None => RangePlan::full(size, chunk_size)?,
        };
        debug!(
            "{} {} bytes {}-{} in {} part(s)",
            disposition, descriptor.handle, plan.from, plan.until, plan.chunk_count
        );

        let handle = descriptor.handle.clone();
        let body = self.streamer.start(descriptor, plan).await?;
        self.count_download(&handle);
        Ok(PreparedStream {
            head,
            handle,
            body: Some(body),
        })
    }

    /// Headers a GET would send, without touching the backend or the quota.
    pub async fn describe(
        &self,
        raw_handle: &str,
        range: Option<&str>,
        disposition: Disposition,
    ) -> GatewayResult<StreamHead> {
        let descriptor = self.resolve(raw_handle).await?;
        let interval = resolve_range(range, descriptor.size_bytes)?;
        Ok(self.head_for(&descriptor, interval, disposition))
    }

    /// Bump the file's download counter off the response path.
    fn count_download(&self, handle: &FileHandle) {
        let store = Arc::clone(&self.store);
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = store.increment_downloads(handle.as_str()).await {
                warn!("failed to count download of {}: {}", handle, e);
            }
        });
    }

    async fn resolve(&self, raw_handle: &str) -> GatewayResult<Arc<FileDescriptor>> {
        let handle = FileHandle::parse(raw_handle).ok_or(GatewayError::NotFound)?;
        self.cache.get(&handle).await
    }

    fn head_for(
        &self,
        descriptor: &FileDescriptor,
        interval: Option<(u64, u64)>,
        disposition: Disposition,
    ) -> StreamHead {
        let size = descriptor.size_bytes;
        let (status, content_length) = match interval {
            Some((from, until)) => (StatusCode::PARTIAL_CONTENT, until - from + 1),
            None => (StatusCode::OK, size),
        };

        let mut headers = HeaderMap::new();
        let content_type = content_type_for(&descriptor.mime_or_category, &descriptor.display_name);
        insert(&mut headers, header::CONTENT_TYPE, &content_type);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
        if let Some((from, until)) = interval {
            insert(
                &mut headers,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", from, until, size),
            );
        }
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );

        match disposition {
            Disposition::Inline => {
                headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
                insert(
                    &mut headers,
                    header::CACHE_CONTROL,
                    &format!("public, max-age={}", self.cache_max_age_secs),
                );
            }
            Disposition::Attachment => {
                insert(
                    &mut headers,
                    header::CONTENT_DISPOSITION,
                    &format!("attachment; filename=\"{}\"", attachment_name(&descriptor.display_name)),
                );
                headers.insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-cache, no-store, must-revalidate"),
                );
            }
        }

        StreamHead {
            status,
            content_length,
            headers,
        }
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_bytes(value.as_bytes()) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!("dropping unencodable {} header", name),
    }
}

/// File name safe to place inside a quoted `Content-Disposition` parameter.
pub fn attachment_name(display_name: &str) -> String {
    let cleaned: String = display_name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}
