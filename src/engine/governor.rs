// Bandwidth governor: admits new streams against the live quota and records bytes written.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::SettingsProvider;
use crate::error::GatewayResult;
use crate::store::MetadataStore;

/// Point-in-time bandwidth figures, as served by `/bandwidth`.
#[derive(Debug, Clone, Serialize)]
pub struct BandwidthSnapshot {
    pub total_bytes_served: u64,
    pub today_bytes_served: u64,
    pub day: NaiveDate,
    pub limit: u64,
    pub remaining: u64,
    pub percentage_used: f64,
    /// Streams currently writing a body.
    pub active_streams: u32,
    /// Bytes recorded by this process since start.
    pub session_bytes_served: u64,
}

pub struct BandwidthGovernor {
    store: Arc<dyn MetadataStore>,
    settings: Arc<dyn SettingsProvider>,
    served_here: AtomicU64,
    active_streams: AtomicU32,
}

impl BandwidthGovernor {
    pub fn new(store: Arc<dyn MetadataStore>, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            store,
            settings,
            served_here: AtomicU64::new(0),
            active_streams: AtomicU32::new(0),
        }
    }

    /// Whether a new stream may start. Reads the quota fresh on every call.
    ///
    /// A store that cannot report its counters refuses admission: the quota is
    /// a hard limit.
    pub async fn admit(&self) -> bool {
        let limit = self.settings.max_bandwidth().await;
        match self.store.bandwidth_state().await {
            Ok(state) => {
                let admitted = state.total_bytes_served < limit;
                if !admitted {
                    warn!(
                        "bandwidth quota exhausted: {} of {} bytes served",
                        state.total_bytes_served, limit
                    );
                }
                admitted
            }
            Err(e) => {
                error!("bandwidth state unavailable, refusing stream: {}", e);
                false
            }
        }
    }

    /// Add `bytes` actually written to a client to the persisted counters.
    pub async fn record(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.served_here.fetch_add(bytes, Ordering::Relaxed);
        match self.store.increment_bandwidth(bytes).await {
            Ok(()) => debug!("recorded {} bytes served", bytes),
            Err(e) => error!("failed to record {} bytes served: {}", bytes, e),
        }
    }

    pub fn stream_started(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_finished(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_streams(&self) -> u32 {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> GatewayResult<BandwidthSnapshot> {
        let state = self.store.bandwidth_state().await?;
        let limit = self.settings.max_bandwidth().await;
        let percentage_used = if limit == 0 {
            100.0
        } else {
            (state.total_bytes_served as f64 / limit as f64 * 100.0).min(100.0)
        };
        Ok(BandwidthSnapshot {
            total_bytes_served: state.total_bytes_served,
            today_bytes_served: state.today_bytes_served,
            day: state.day_boundary,
            limit,
            remaining: limit.saturating_sub(state.total_bytes_served),
            percentage_used,
            active_streams: self.active_streams(),
            session_bytes_served: self.served_here.load(Ordering::Relaxed),
        })
    }
}
