// Operational endpoints: bandwidth usage and liveness.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

use super::handler::SharedGateway;
use crate::engine::governor::BandwidthSnapshot;

#[derive(Debug, Serialize)]
struct FormattedBandwidth {
    total_bandwidth: String,
    today_bandwidth: String,
    limit: String,
    remaining: String,
}

#[derive(Debug, Serialize)]
struct BandwidthReport {
    total_bandwidth: u64,
    today_bandwidth: u64,
    day: String,
    limit: u64,
    remaining: u64,
    percentage: f64,
    active_streams: u32,
    formatted: FormattedBandwidth,
}

impl From<BandwidthSnapshot> for BandwidthReport {
    fn from(s: BandwidthSnapshot) -> Self {
        Self {
            total_bandwidth: s.total_bytes_served,
            today_bandwidth: s.today_bytes_served,
            day: s.day.to_string(),
            limit: s.limit,
            remaining: s.remaining,
            percentage: (s.percentage_used * 100.0).round() / 100.0,
            active_streams: s.active_streams,
            formatted: FormattedBandwidth {
                total_bandwidth: format_size(s.total_bytes_served),
                today_bandwidth: format_size(s.today_bytes_served),
                limit: format_size(s.limit),
                remaining: format_size(s.remaining),
            },
        }
    }
}

/// GET /bandwidth
pub(crate) async fn bandwidth_handler(State(gateway): State<SharedGateway>) -> Response {
    match gateway.governor().snapshot().await {
        Ok(snapshot) => Json(BandwidthReport::from(snapshot)).into_response(),
        Err(e) => {
            error!("bandwidth report failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /health
pub(crate) async fn health_handler(State(gateway): State<SharedGateway>) -> Response {
    let streaming = if gateway.is_shutting_down() {
        "stopping"
    } else {
        "ready"
    };
    Json(json!({
        "status": "ok",
        "streaming_service": streaming,
        "active_streams": gateway.governor().active_streams(),
        "cached_descriptors": gateway.cache().len(),
    }))
    .into_response()
}

/// Human-readable byte count with binary units, e.g. `1.50 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}
