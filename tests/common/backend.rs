// In-process backend holding objects in memory, with fault injection and call counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use filestream_gateway::error::BackendError;
use filestream_gateway::source::location::{ObjectKind, ObjectLocation};
use filestream_gateway::source::traits::{
    BackendTransport, Credentials, ExportedAuthorization, ShardId, ShardLink,
};

#[derive(Default)]
struct Faults {
    import_rejections: HashMap<ShardId, u32>,
    rate_limits: u32,
    retry_after: Duration,
    fetch_error: Option<BackendError>,
    fetch_delay: Duration,
    connect_delay: Duration,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    exports: AtomicUsize,
    imports: AtomicUsize,
    fetches: AtomicUsize,
    closed: AtomicUsize,
}

struct Inner {
    home: ShardId,
    objects: RwLock<HashMap<(ShardId, u64), Bytes>>,
    faults: Mutex<Faults>,
    counters: Counters,
    next_auth_id: AtomicI64,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new(home: ShardId) -> Self {
        Self {
            inner: Arc::new(Inner {
                home,
                objects: RwLock::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                counters: Counters::default(),
                next_auth_id: AtomicI64::new(1),
            }),
        }
    }

    /// Store `data` on `shard` and return the location that fetches it.
    pub fn put_object(&self, shard: ShardId, media_id: u64, data: Bytes) -> ObjectLocation {
        self.inner.objects.write().insert((shard, media_id), data);
        ObjectLocation {
            kind: ObjectKind::Document,
            media_id,
            access_hash: media_id ^ 0x5A5A_5A5A,
            file_reference: Bytes::from(media_id.to_be_bytes().to_vec()),
            thumb_size: String::new(),
        }
    }

    pub fn remove_object(&self, shard: ShardId, media_id: u64) {
        self.inner.objects.write().remove(&(shard, media_id));
    }

    /// Reject the next `times` authorization imports on `shard`.
    pub fn reject_imports(&self, shard: ShardId, times: u32) {
        self.inner.faults.lock().import_rejections.insert(shard, times);
    }

    /// Answer the next `times` fetches with a rate-limit response.
    pub fn rate_limit_fetches(&self, times: u32, retry_after: Duration) {
        let mut faults = self.inner.faults.lock();
        faults.rate_limits = times;
        faults.retry_after = retry_after;
    }

    /// Fail every fetch with `error` until cleared with `None`.
    pub fn fail_fetches(&self, error: Option<BackendError>) {
        self.inner.faults.lock().fetch_error = error;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.inner.faults.lock().fetch_delay = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.faults.lock().connect_delay = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.inner.counters.connects.load(Ordering::SeqCst)
    }

    pub fn export_count(&self) -> usize {
        self.inner.counters.exports.load(Ordering::SeqCst)
    }

    pub fn import_count(&self) -> usize {
        self.inner.counters.imports.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.counters.fetches.load(Ordering::SeqCst)
    }

    pub fn closed_links(&self) -> usize {
        self.inner.counters.closed.load(Ordering::SeqCst)
    }
}

fn auth_bytes_for(shard: ShardId) -> Bytes {
    Bytes::from(format!("auth:{}", shard))
}

#[async_trait]
impl BackendTransport for MemoryBackend {
    fn home_shard(&self) -> ShardId {
        self.inner.home
    }

    async fn connect(
        &self,
        shard: ShardId,
        credentials: Credentials,
    ) -> Result<Arc<dyn ShardLink>, BackendError> {
        self.inner.counters.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.inner.faults.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let authorized = credentials == Credentials::Home && shard == self.inner.home;
        debug!("memory backend connect shard={} authorized={}", shard, authorized);
        Ok(Arc::new(MemoryLink {
            shard,
            authorized: AtomicBool::new(authorized),
            closed: AtomicBool::new(false),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn export_authorization(
        &self,
        target: ShardId,
    ) -> Result<ExportedAuthorization, BackendError> {
        self.inner.counters.exports.fetch_add(1, Ordering::SeqCst);
        Ok(ExportedAuthorization {
            id: self.inner.next_auth_id.fetch_add(1, Ordering::SeqCst),
            bytes: auth_bytes_for(target),
        })
    }
}

struct MemoryLink {
    shard: ShardId,
    authorized: AtomicBool,
    closed: AtomicBool,
    inner: Arc<Inner>,
}

#[async_trait]
impl ShardLink for MemoryLink {
    async fn import_authorization(
        &self,
        auth: &ExportedAuthorization,
    ) -> Result<(), BackendError> {
        self.inner.counters.imports.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.inner.faults.lock();
            if let Some(remaining) = faults.import_rejections.get_mut(&self.shard) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::AuthKeyInvalid);
                }
            }
        }
        if auth.bytes != auth_bytes_for(self.shard) {
            return Err(BackendError::AuthKeyInvalid);
        }
        self.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_chunk(
        &self,
        location: &ObjectLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError> {
        self.inner.counters.fetches.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::SessionClosed);
        }
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("link not authorized".to_string()));
        }

        let delay = {
            let mut faults = self.inner.faults.lock();
            if let Some(err) = &faults.fetch_error {
                return Err(err.clone());
            }
            if faults.rate_limits > 0 {
                faults.rate_limits -= 1;
                return Err(BackendError::RateLimited {
                    retry_after: faults.retry_after,
                });
            }
            faults.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let data = self
            .inner
            .objects
            .read()
            .get(&(self.shard, location.media_id))
            .cloned()
            .ok_or(BackendError::ObjectGone)?;

        let len = data.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let end = (offset + limit).min(len);
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
