// Shared fixture: in-memory backend and store behind a real gateway.

#![allow(dead_code)]

pub mod backend;
pub mod store;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use filestream_gateway::config::{GatewayConfig, LiveSettings};
use filestream_gateway::engine::streamer::ChunkStream;
use filestream_gateway::handle::{FileHandle, HandleSigner};
use filestream_gateway::source::traits::ShardId;
use filestream_gateway::store::{FileRecord, MetadataStore};
use filestream_gateway::{GatewayResult, StreamingGateway};

use backend::MemoryBackend;
use store::CountingStore;

pub const MB: u64 = 1024 * 1024;
pub const CONTENT_SIZE: usize = 10 * 1024 * 1024; // 10 MiB
pub const HOME_SHARD: ShardId = 2;
pub const FOREIGN_SHARD: ShardId = 4;

/// Deterministic content whose chunks all differ from each other.
pub fn generate_content(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
}

pub struct Fixture {
    pub backend: MemoryBackend,
    pub store: Arc<CountingStore>,
    pub settings: Arc<LiveSettings>,
    pub gateway: Arc<StreamingGateway>,
    pub signer: HandleSigner,
    pub shutdown: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let backend = MemoryBackend::new(HOME_SHARD);
        let store = Arc::new(CountingStore::new());
        let settings = Arc::new(LiveSettings::from_config(&config.streaming));
        let shutdown = CancellationToken::new();
        let gateway = Arc::new(StreamingGateway::new(
            &config,
            store.clone(),
            Arc::new(backend.clone()),
            settings.clone(),
            shutdown.clone(),
        ));
        Self {
            backend,
            store,
            settings,
            gateway,
            signer: HandleSigner::new(&config.security.secret_key),
            shutdown,
        }
    }

    /// Put `content` on `shard` and register it in the store.
    pub fn publish(
        &self,
        backend_object_id: i64,
        shard: ShardId,
        content: Bytes,
        mime_or_category: &str,
        display_name: &str,
    ) -> FileHandle {
        let location = self
            .backend
            .put_object(shard, backend_object_id as u64, content.clone());
        let handle = self.signer.derive(backend_object_id);
        self.store.insert(FileRecord {
            handle: handle.to_string(),
            backend_object_id,
            shard_id: shard,
            access_token: location.access_hash,
            object_reference: location.encode(),
            size_bytes: content.len() as u64,
            mime_or_category: mime_or_category.to_string(),
            display_name: display_name.to_string(),
        });
        handle
    }

    pub async fn total_served(&self) -> u64 {
        self.store
            .bandwidth_state()
            .await
            .unwrap()
            .total_bytes_served
    }

    /// Poll the bandwidth total until it equals `expect` or a second passes.
    pub async fn wait_for_total(&self, expect: u64) -> u64 {
        for _ in 0..100 {
            let total = self.total_served().await;
            if total == expect {
                return total;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.total_served().await
    }
}

impl Fixture {
    /// Poll the download counter of `handle` until it equals `expect` or a second passes.
    pub async fn wait_for_downloads(&self, handle: &FileHandle, expect: u64) -> u64 {
        for _ in 0..100 {
            let count = self.store.download_count(handle.as_str());
            if count == expect {
                return count;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.store.download_count(handle.as_str())
    }
}

/// Drain a body stream into one buffer.
pub async fn collect(mut stream: ChunkStream) -> GatewayResult<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(part) = stream.next().await {
        out.extend_from_slice(&part?);
    }
    Ok(out)
}
