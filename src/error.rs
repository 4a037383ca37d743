// Error taxonomy for the streaming core and its HTTP mapping.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::source::traits::ShardId;

/// Failures reported by a backend transport or shard link.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The shard rejected an imported authorization. Transient; the export is retried.
    #[error("authorization bytes rejected by shard")]
    AuthKeyInvalid,

    /// The backend asked the caller to wait before repeating the request.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// The referenced object no longer exists on the backend.
    #[error("object gone")]
    ObjectGone,

    /// The session behind a link is no longer usable.
    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    /// Whether the failure means the shard session itself is broken.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionClosed | Self::Transport(_))
    }
}

/// Failures of the external metadata store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid seed data: {0}")]
    Seed(String),
}

/// Errors surfaced by the streaming gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("file not found")]
    NotFound,

    #[error("range not satisfiable for {size} byte object")]
    RangeNotSatisfiable { size: u64 },

    #[error("bandwidth quota exhausted")]
    QuotaExceeded,

    #[error("authorization for shard {shard} failed after {attempts} attempts")]
    AuthFailure { shard: ShardId, attempts: u32 },

    #[error("backend kept rate limiting after {waits} waits")]
    RateLimited { waits: u32 },

    /// The backend returned fewer bytes than the plan needs for a part.
    #[error("short chunk for part {part}: got {got} bytes")]
    ShortChunk { part: u64, got: usize },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("stream cancelled")]
    Cancelled,

    /// The live settings produced a chunk size no plan can use.
    #[error("invalid chunk size {0}")]
    ChunkSize(u64),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound | Self::Backend(BackendError::ObjectGone) => StatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::QuotaExceeded | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::AuthFailure { .. }
            | Self::RateLimited { .. }
            | Self::ShortChunk { .. }
            | Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::ChunkSize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::NotFound | Self::Backend(BackendError::ObjectGone) => "file not found",
            Self::RangeNotSatisfiable { .. } => "range not satisfiable",
            Self::QuotaExceeded => "bandwidth limit exceeded",
            Self::Cancelled => "service shutting down",
            Self::Store(_) | Self::ChunkSize(_) => "internal error",
            _ => "upstream unavailable",
        };

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Self::RangeNotSatisfiable { size } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}
