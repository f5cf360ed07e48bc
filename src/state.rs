//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket upgrade through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: effective configuration, read by handlers
//! - **metrics**: HTTP request counters, updated by the metrics middleware
//! - **registry**: the session table, the only state shared between sessions
//! - **connector**: opens the upstream session for each new client
//!
//! ## Arc<RwLock<T>> Pattern
//! Config and HTTP metrics use `std::sync::RwLock`: they are touched briefly
//! from synchronous code and the guard never crosses an `.await`. The session
//! registry carries its own async lock.

use crate::config::AppConfig;
use crate::relay::{SessionRegistry, UpstreamConnector};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
///
/// Cloning is cheap: every field is either `Arc`-backed or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, fixed after startup
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live relay sessions keyed by client id
    pub registry: SessionRegistry,

    /// Upstream connection factory shared by all sessions
    pub connector: Arc<dyn UpstreamConnector>,

    /// When the server started
    pub start_time: Instant,
}

/// HTTP request metrics collected by the middleware.
///
/// Relay traffic (frames, bytes, sessions) is counted by the registry instead.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create the state; the registry is sized from `relay.max_concurrent_sessions`.
    pub fn new(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let registry = SessionRegistry::new(config.relay.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            connector,
            start_time: Instant::now(),
        }
    }

    // Writers never panic while holding these locks, so a poisoned guard still
    // protects consistent data.
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: method and path (e.g., "GET /health")
    /// - **duration_ms**: how long the request took to process
    /// - **is_error**: whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so the lock is not held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.read_metrics();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate in `[0.0, 1.0]`.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::link::testing::ScriptedConnector;

    fn state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(ScriptedConnector::failing()))
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_counters() {
        let state = state();
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
    }

    #[tokio::test]
    async fn test_registry_sized_from_config() {
        let mut config = AppConfig::default();
        config.relay.max_concurrent_sessions = 1;
        let state = AppState::new(config, Arc::new(ScriptedConnector::failing()));

        state.registry.create("a").await.unwrap();
        assert!(state.registry.create("b").await.is_err());
    }
}
