// In-memory metadata store, optionally seeded from a JSON file.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::info;

use super::{BandwidthState, FileRecord, MetadataStore};
use crate::error::StoreError;

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    files: Vec<FileRecord>,
    #[serde(default)]
    total_bytes_served: u64,
    #[serde(default)]
    quota: Option<u64>,
}

pub struct MemoryStore {
    records: RwLock<HashMap<String, FileRecord>>,
    bandwidth: Mutex<BandwidthState>,
    quota: RwLock<Option<u64>>,
    downloads: Mutex<HashMap<String, u64>>,
}

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bandwidth: Mutex::new(BandwidthState::new(utc_today())),
            quota: RwLock::new(None),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Build a store from a JSON seed file: `{"files": [...], "total_bytes_served": n, "quota": n}`.
    pub fn load_seed(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.display(), e)))?;
        let seed: Seed =
            serde_json::from_str(&raw).map_err(|e| StoreError::Seed(e.to_string()))?;

        let store = Self::new();
        let count = seed.files.len();
        for record in seed.files {
            store.insert(record);
        }
        store.bandwidth.lock().total_bytes_served = seed.total_bytes_served;
        *store.quota.write() = seed.quota;
        info!("metadata store seeded with {} file(s) from {}", count, path.display());
        Ok(store)
    }

    pub fn insert(&self, record: FileRecord) {
        self.records.write().insert(record.handle.clone(), record);
    }

    /// Remove a record; later lookups of its handle miss.
    pub fn revoke(&self, handle: &str) -> bool {
        self.records.write().remove(handle).is_some()
    }

    pub fn set_quota(&self, quota: Option<u64>) {
        *self.quota.write() = quota;
    }

    /// Downloads counted for `handle` so far.
    pub fn download_count(&self, handle: &str) -> u64 {
        self.downloads.lock().get(handle).copied().unwrap_or(0)
    }

    fn increment_on(&self, bytes: u64, today: NaiveDate) {
        let mut state = self.bandwidth.lock();
        state.roll_to(today);
        state.total_bytes_served = state.total_bytes_served.saturating_add(bytes);
        state.today_bytes_served = state.today_bytes_served.saturating_add(bytes);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn lookup_by_handle(&self, handle: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.records.read().get(handle).cloned())
    }

    async fn increment_bandwidth(&self, bytes: u64) -> Result<(), StoreError> {
        self.increment_on(bytes, utc_today());
        Ok(())
    }

    async fn increment_downloads(&self, handle: &str) -> Result<(), StoreError> {
        *self.downloads.lock().entry(handle.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn bandwidth_state(&self) -> Result<BandwidthState, StoreError> {
        let mut state = self.bandwidth.lock();
        state.roll_to(utc_today());
        Ok(*state)
    }

    async fn quota(&self) -> Result<Option<u64>, StoreError> {
        Ok(*self.quota.read())
    }
}
