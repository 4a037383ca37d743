// Metadata store contract: file records, bandwidth counters and the operator quota.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::source::traits::ShardId;

pub use memory::MemoryStore;

/// What the store knows about a published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub handle: String,
    pub backend_object_id: i64,
    pub shard_id: ShardId,
    pub access_token: u64,
    /// Packed backend location, see [`crate::source::location::ObjectLocation`].
    pub object_reference: String,
    pub size_bytes: u64,
    /// Either a MIME type ("video/x-matroska") or a coarse category ("video").
    pub mime_or_category: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthState {
    pub total_bytes_served: u64,
    pub today_bytes_served: u64,
    /// UTC date `today_bytes_served` belongs to.
    pub day_boundary: NaiveDate,
}

impl BandwidthState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            total_bytes_served: 0,
            today_bytes_served: 0,
            day_boundary: today,
        }
    }

    /// Reset the daily counter when `today` is past the stored boundary.
    pub fn roll_to(&mut self, today: NaiveDate) {
        if today > self.day_boundary {
            self.today_bytes_served = 0;
            self.day_boundary = today;
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn lookup_by_handle(&self, handle: &str) -> Result<Option<FileRecord>, StoreError>;

    /// Add `bytes` to both counters. Concurrent increments must not be lost.
    async fn increment_bandwidth(&self, bytes: u64) -> Result<(), StoreError>;

    /// Count one more admitted download of the file behind `handle`.
    async fn increment_downloads(&self, handle: &str) -> Result<(), StoreError>;

    async fn bandwidth_state(&self) -> Result<BandwidthState, StoreError>;

    /// Operator quota override, if one is set.
    async fn quota(&self) -> Result<Option<u64>, StoreError>;
}
