use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::location::ObjectLocation;
use crate::error::BackendError;

/// Identifier of an independently addressed backend partition.
pub type ShardId = u32;

/// Key material a new shard connection is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials {
    /// Reuse the authorization the primary connection already holds.
    Home,
    /// Negotiate a fresh, not yet authorized key for a foreign shard.
    Fresh,
}

/// Authorization exported by the home connection for a foreign shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedAuthorization {
    pub id: i64,
    pub bytes: Bytes,
}

/// The primary, already authorized connection to the backend.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// Shard the primary connection is authorized on.
    fn home_shard(&self) -> ShardId;

    /// Open a new connection to `shard`.
    async fn connect(
        &self,
        shard: ShardId,
        credentials: Credentials,
    ) -> Result<Arc<dyn ShardLink>, BackendError>;

    /// Ask the home connection for an authorization usable on `target`.
    async fn export_authorization(
        &self,
        target: ShardId,
    ) -> Result<ExportedAuthorization, BackendError>;
}

/// A connection to one shard. Implementations multiplex concurrent requests.
#[async_trait]
pub trait ShardLink: Send + Sync {
    async fn import_authorization(&self, auth: &ExportedAuthorization)
        -> Result<(), BackendError>;

    /// Fetch up to `limit` bytes of the object at `offset`. An empty result means EOF.
    async fn fetch_chunk(
        &self,
        location: &ObjectLocation,
        offset: u64,
        limit: u64,
    ) -> Result<Bytes, BackendError>;

    async fn close(&self) {}
}
