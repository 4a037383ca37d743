// Chunk streamer: pulls planned parts from a shard session in order and yields the trimmed bytes.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::cache::FileDescriptor;
use super::planner::RangePlan;
use super::session::{ShardSession, ShardSessionManager};
use crate::config::StreamingConfig;
use crate::error::{BackendError, GatewayError, GatewayResult};

/// Lazy, finite sequence of byte slices for one request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<Bytes>> + Send>>;

/// How long a single part may be held up by backend rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_waits: u32,
    pub max_wait: Duration,
}

impl RateLimitPolicy {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            max_waits: config.max_rate_limit_waits,
            max_wait: Duration::from_secs(config.max_rate_limit_wait_secs),
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}

pub struct ChunkStreamer {
    sessions: Arc<ShardSessionManager>,
    rate_limits: RateLimitPolicy,
    shutdown: CancellationToken,
}

impl ChunkStreamer {
    pub fn new(
        sessions: Arc<ShardSessionManager>,
        rate_limits: RateLimitPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            rate_limits,
            shutdown,
        }
    }

    /// Begin streaming `plan` of `descriptor`.
    ///
    /// The shard session is acquired and the first part fetched before this
    /// returns, so setup failures reach the caller before any response is
    /// committed. Remaining parts are fetched one at a time as the consumer
    /// polls; dropping the stream stops the fetch loop.
    pub async fn start(
        &self,
        descriptor: Arc<FileDescriptor>,
        plan: RangePlan,
    ) -> GatewayResult<ChunkStream> {
        let session = self.sessions.session_for(descriptor.shard_id).await?;
        let fetcher = PartFetcher {
            sessions: Arc::clone(&self.sessions),
            session,
            descriptor,
            plan,
            rate_limits: self.rate_limits,
            shutdown: self.shutdown.clone(),
        };

        let first = fetcher.fetch(1).await?;
        debug!(
            "streaming {} parts of {} from offset {}",
            plan.chunk_count, fetcher.descriptor.handle, plan.fetch_offset
        );

        let stream = async_stream::try_stream! {
            yield first;
            for part in 2..=plan.chunk_count {
                let bytes = fetcher.fetch(part).await?;
                yield bytes;
            }
            debug!("all {} parts of {} emitted", plan.chunk_count, fetcher.descriptor.handle);
        };

        Ok(Box::pin(stream))
    }
}

struct PartFetcher {
    sessions: Arc<ShardSessionManager>,
    session: Arc<ShardSession>,
    descriptor: Arc<FileDescriptor>,
    plan: RangePlan,
    rate_limits: RateLimitPolicy,
    shutdown: CancellationToken,
}

impl PartFetcher {
    /// Fetch and trim one part, waiting out rate limits.
    async fn fetch(&self, part: u64) -> GatewayResult<Bytes> {
        let offset = self.plan.part_offset(part);
        let mut waits = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("part {} of {} abandoned: shutdown", part, self.descriptor.handle);
                    return Err(GatewayError::Cancelled);
                }
                r = self.session.fetch_chunk(&self.descriptor.location, offset, self.plan.chunk_size) => r,
            };

            match result {
                Ok(chunk) => {
                    let got = chunk.len();
                    debug!("part {}/{} at {} ({} bytes)", part, self.plan.chunk_count, offset, got);
                    return self.plan.trim(part, chunk).ok_or_else(|| {
                        error!(
                            "backend returned {} bytes for part {} of {} at offset {}",
                            got, part, self.descriptor.handle, offset
                        );
                        GatewayError::ShortChunk { part, got }
                    });
                }
                Err(BackendError::RateLimited { retry_after }) => {
                    if waits >= self.rate_limits.max_waits {
                        warn!(
                            "giving up on part {} of {} after {} rate-limit waits",
                            part, self.descriptor.handle, waits
                        );
                        return Err(GatewayError::RateLimited { waits });
                    }
                    waits += 1;
                    let wait = retry_after.min(self.rate_limits.max_wait);
                    warn!(
                        "rate limited on part {} of {}, waiting {:?}",
                        part, self.descriptor.handle, wait
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) if e.is_session_fatal() => {
                    error!(
                        "session for shard {} failed mid-stream: {}",
                        self.session.shard(),
                        e
                    );
                    self.sessions.invalidate(&self.session).await;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("fetch of part {} of {} failed: {}", part, self.descriptor.handle, e);
                    return Err(e.into());
                }
            }
        }
    }
}
