//! # Application State
//!
//! Shared state handed to every HTTP handler on both endpoints.
//!
//! ## What lives here:
//! - **config**: the loaded configuration, read-only after startup
//! - **engine**: the handle to the call engine; all call operations go
//!   through its mailbox, never through a lock
//! - **metrics**: per-endpoint request counters updated by the metrics
//!   middleware
//! - **start_time**: for uptime reporting
//!
//! ## Locking:
//! Only the request metrics sit behind an `Arc<RwLock<T>>`. Call state is
//! owned by the engine task and reaches handlers as immutable snapshots, so
//! no handler ever blocks another one while a call is being joined.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::call::EngineHandle;
use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: EngineHandle,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Request counters across both endpoints.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Media-tap WebSocket clients currently attached
    pub active_taps: u32,
    /// Keyed by `METHOD /route/pattern`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, engine: EngineHandle) -> Self {
        Self {
            config,
            engine,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one finished request.
    ///
    /// The route pattern is used instead of the raw path so that
    /// `DELETE /api/v1/jobs/q1` and `DELETE /api/v1/jobs/q2` land in the
    /// same bucket.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn tap_opened(&self) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .active_taps += 1;
    }

    pub fn tap_closed(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_taps = metrics.active_taps.saturating_sub(1);
    }

    /// Copy of the counters, taken under the read lock and released before
    /// serialization.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::call::CallEngine;
    use crate::identity::ConnectionSlots;
    use crate::media::decoder::PcmReader;
    use crate::media::{AudioSource, SourceDecoder};
    use crate::error::CallError;
    use async_trait::async_trait;

    struct NoAudio;

    #[async_trait]
    impl SourceDecoder for NoAudio {
        async fn open(&self, _source: &AudioSource) -> Result<PcmReader, CallError> {
            Ok(PcmReader::from_chunks(Vec::new()))
        }
    }

    /// State backed by an engine that was never started: commands fail with
    /// `EngineUnavailable` and status reads return the initial snapshot.
    pub(crate) fn idle_state() -> AppState {
        let config = Arc::new(AppConfig::default());
        let (_engine, handle) = CallEngine::new(config.clone(), ConnectionSlots::default(), Arc::new(NoAudio));
        AppState::new(config, handle)
    }

    #[test]
    fn test_record_request() {
        let state = idle_state();
        state.record_request("GET /api/v1/status", 4, false);
        state.record_request("GET /api/v1/status", 6, true);
        state.record_request("POST /api/v1/join", 10, false);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);
        let status = &metrics.endpoint_metrics["GET /api/v1/status"];
        assert_eq!(status.average_duration_ms(), 5.0);
        assert_eq!(status.error_rate(), 0.5);
    }

    #[test]
    fn test_tap_counter_never_underflows() {
        let state = idle_state();
        state.tap_closed();
        state.tap_opened();
        assert_eq!(state.metrics_snapshot().active_taps, 1);
        state.tap_closed();
        state.tap_closed();
        assert_eq!(state.metrics_snapshot().active_taps, 0);
    }
}
