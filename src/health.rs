//! # Health and Metrics Endpoints
//!
//! Read-only observability surface. The only relay state these handlers touch
//! is the registry's session count and counters.
//!
//! - `GET /`: service banner
//! - `GET /health`, `GET /api/v1/health`: liveness with the active session count
//! - `GET /api/v1/metrics`: HTTP and relay counters

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "message": "Voice relay server is running",
        "websocket_endpoint": "/ws/audio/{client_id}",
        "status": "healthy"
    }))
}

/// `{"status": "healthy", "active_connections": <int>, "model": <string>}`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let active_connections = state.registry.active_count().await;
    let model = state.get_config().upstream.model;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "active_connections": active_connections,
        "model": model
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let relay = state.registry.stats().await;
    let max_sessions = state.get_config().relay.max_concurrent_sessions;

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "relay": {
            "active_sessions": relay.active,
            "max_concurrent_sessions": max_sessions,
            "session_usage": if max_sessions > 0 {
                relay.active as f64 / max_sessions as f64
            } else {
                0.0
            },
            "sessions_opened": relay.opened,
            "sessions_closed": relay.closed,
            "rejected_duplicate": relay.rejected_duplicate,
            "rejected_capacity": relay.rejected_capacity,
            "client_to_upstream": {
                "frames": relay.frames_from_client,
                "bytes": relay.bytes_from_client
            },
            "upstream_to_client": {
                "frames": relay.frames_to_client,
                "bytes": relay.bytes_to_client
            },
            "malformed_frames_dropped": relay.malformed_dropped
        }
    }))
}
