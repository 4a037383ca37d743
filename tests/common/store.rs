// Metadata store wrapper that counts lookups and can slow them down.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use filestream_gateway::error::StoreError;
use filestream_gateway::store::{BandwidthState, FileRecord, MemoryStore, MetadataStore};

#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    lookups: AtomicUsize,
    lookup_delay: Mutex<Duration>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `lookup_by_handle` calls served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Delay every lookup, to widen races.
    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock() = delay;
    }
}

impl Deref for CountingStore {
    type Target = MemoryStore;

    fn deref(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl MetadataStore for CountingStore {
    async fn lookup_by_handle(&self, handle: &str) -> Result<Option<FileRecord>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.lookup_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.lookup_by_handle(handle).await
    }

    async fn increment_bandwidth(&self, bytes: u64) -> Result<(), StoreError> {
        self.inner.increment_bandwidth(bytes).await
    }

    async fn increment_downloads(&self, handle: &str) -> Result<(), StoreError> {
        self.inner.increment_downloads(handle).await
    }

    async fn bandwidth_state(&self) -> Result<BandwidthState, StoreError> {
        self.inner.bandwidth_state().await
    }

    async fn quota(&self) -> Result<Option<u64>, StoreError> {
        self.inner.quota().await
    }
}
