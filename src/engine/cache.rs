// Descriptor cache: decoded backend references keyed by handle, flushed wholesale on a timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::handle::FileHandle;
use crate::source::location::{LocationError, ObjectLocation};
use crate::source::traits::ShardId;
use crate::store::{FileRecord, MetadataStore};

const MIN_FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Everything the streaming path needs to know about one backend object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub handle: FileHandle,
    pub backend_object_id: i64,
    pub shard_id: ShardId,
    pub location: ObjectLocation,
    pub size_bytes: u64,
    pub mime_or_category: String,
    pub display_name: String,
}

impl FileDescriptor {
    pub fn decode(handle: FileHandle, record: FileRecord) -> Result<Self, LocationError> {
        let location = ObjectLocation::decode(&record.object_reference, record.access_token)?;
        Ok(Self {
            handle,
            backend_object_id: record.backend_object_id,
            shard_id: record.shard_id,
            location,
            size_bytes: record.size_bytes,
            mime_or_category: record.mime_or_category,
            display_name: record.display_name,
        })
    }
}

type Slot = Arc<OnceCell<Arc<FileDescriptor>>>;

pub struct DescriptorCache {
    store: Arc<dyn MetadataStore>,
    entries: Mutex<HashMap<FileHandle, Slot>>,
    decodes: AtomicUsize,
}

impl DescriptorCache {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
            decodes: AtomicUsize::new(0),
        }
    }

    /// Return the descriptor for `handle`, resolving it on a miss.
    ///
    /// Concurrent misses on the same handle share one resolution. Failures
    /// are never cached.
    pub async fn get(&self, handle: &FileHandle) -> GatewayResult<Arc<FileDescriptor>> {
        let slot = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(handle.clone()).or_default())
        };

        match slot.get_or_try_init(|| self.resolve(handle)).await {
            Ok(descriptor) => Ok(Arc::clone(descriptor)),
            Err(e) => {
                let mut entries = self.entries.lock();
                let stale = entries
                    .get(handle)
                    .is_some_and(|cur| Arc::ptr_eq(cur, &slot) && cur.get().is_none());
                if stale {
                    entries.remove(handle);
                }
                Err(e)
            }
        }
    }

    async fn resolve(&self, handle: &FileHandle) -> GatewayResult<Arc<FileDescriptor>> {
        debug!("descriptor cache miss for {}", handle);
        let record = match self.store.lookup_by_handle(handle.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(GatewayError::NotFound),
            Err(e) => {
                warn!("descriptor lookup failed for {}: {}", handle, e);
                return Err(GatewayError::NotFound);
            }
        };

        let descriptor = FileDescriptor::decode(handle.clone(), record).map_err(|e| {
            warn!("undecodable object reference for {}: {}", handle, e);
            GatewayError::NotFound
        })?;
        self.decodes.fetch_add(1, Ordering::Relaxed);
        debug!(
            "decoded descriptor {} shard={} size={}",
            handle, descriptor.shard_id, descriptor.size_bytes
        );
        Ok(Arc::new(descriptor))
    }

    /// Drop every entry. Returns how many resolved descriptors were evicted.
    pub fn flush(&self) -> usize {
        let mut entries = self.entries.lock();
        let evicted = entries.values().filter(|slot| slot.initialized()).count();
        entries.clear();
        evicted
    }

    /// Number of resolved descriptors currently held.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total successful decodes since construction.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Flush the cache every `every` until `shutdown` fires.
    ///
    /// A zero period is raised to one second.
    pub fn spawn_janitor(
        self: Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let every = if every.is_zero() {
            warn!("descriptor flush period of zero raised to 1s");
            MIN_FLUSH_PERIOD
        } else {
            every
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.flush();
                        debug!("descriptor cache flushed ({} entries)", evicted);
                    }
                    _ = shutdown.cancelled() => {
                        debug!("descriptor cache janitor stopped");
                        return;
                    }
                }
            }
        })
    }
}
