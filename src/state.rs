//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the validated configuration, read-only after startup
//! - **metrics**: HTTP request counters updated by `MetricsMiddleware`
//! - **gateway**: the call entry point, which also owns the connection
//!   registry and the call counters
//!
//! ## Arc<RwLock<T>> Pattern
//! Request metrics are written by every request and read by the metrics
//! endpoint, so they sit behind a reader-writer lock. Call counters are plain
//! atomics inside the gateway because call tasks update them off the request
//! path.

use crate::config::AppConfig;
use crate::ingestion::gateway::{CallMetricsSnapshot, Gateway};
use crate::ingestion::registry::{ConnectionRegistry, RegistrySummary};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// HTTP request metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Call entry point shared by the AudioHook endpoint and the monitor
    pub gateway: Arc<Gateway>,
}

/// HTTP request counters.
///
/// ## Why these metrics matter:
/// - **request_count**: upgrade and API traffic (load monitoring)
/// - **error_count**: rejected upgrades and failed requests
/// - **endpoint_metrics**: per-route latency and error rate
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            gateway,
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.gateway.registry()
    }

    /// Number of calls currently registered.
    pub fn active_calls(&self) -> usize {
        self.registry().count()
    }

    pub fn call_metrics(&self) -> CallMetricsSnapshot {
        self.gateway.metrics().snapshot()
    }

    pub fn registry_summary(&self) -> RegistrySummary {
        self.registry().summary()
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The route (e.g., "GET /health", "GET /audiohook")
    /// - **duration_ms**: How long the request took to process
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current request metrics (used for the /metrics endpoint).
    ///
    /// Clones so the lock is not held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
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
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
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
    use super::testing::app_state;
    use super::*;

    #[test]
    fn test_endpoint_metrics() {
        let state = app_state(AppConfig::default());
        state.increment_request_count();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);
        state.increment_error_count();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.error_count, 1);

        let health = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_call_counters_start_empty() {
        let state = app_state(AppConfig::default());
        assert_eq!(state.active_calls(), 0);
        assert_eq!(state.call_metrics().calls_accepted, 0);
        assert_eq!(state.registry_summary().max_calls, 200);
    }
}
