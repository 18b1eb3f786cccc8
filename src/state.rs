//! # Application State Management
//!
//! Everything the HTTP handlers and the device listener share: configuration,
//! metrics, and handles to the gateway core (hub, broker, transcriber).
//!
//! ## Sharing pattern:
//! - **Arc<RwLock<T>>** for data that changes at runtime (config, metrics).
//!   Readers clone what they need and release the lock straight away.
//! - **Cheap handles** for the core: `Hub` is a channel sender, the broker and
//!   transcriber sit behind `Arc`. Cloning `AppState` clones handles, never the
//!   underlying registries.
//! - **Semaphore** for the upload concurrency limit, so a slot is returned even
//!   when a handler exits early with `?`.
//!
//! Poisoned locks are recovered rather than propagated: a panic in one request
//! must not take metrics or config down for every other request.

use crate::broker::Broker;
use crate::config::AppConfig;
use crate::hub::Hub;
use crate::transcription::Transcriber;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct AppState {
    /// Runtime-updatable configuration.
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,

    pub hub: Hub,

    pub broker: Arc<Broker>,

    /// Used by the HTTP upload path; device sessions get theirs via `SessionServices`.
    pub transcriber: Arc<dyn Transcriber>,

    /// One permit per in-flight audio upload.
    pub upload_slots: Arc<Semaphore>,

    /// Most permits `upload_slots` has ever been given.
    upload_capacity: Arc<AtomicUsize>,
}

/// Counters collected across HTTP requests and device sessions.
///
/// - **request_count / error_count**: every HTTP request and every 4xx/5xx
/// - **active_sessions**: devices connected right now
/// - **sessions_opened / sessions_closed**: lifetime totals for device sessions
/// - **transcriptions_published**: upload results handed to the broker
/// - **endpoint_metrics**: per-route statistics, keyed like `"GET /health"`
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub transcriptions_published: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, hub: Hub, broker: Arc<Broker>, transcriber: Arc<dyn Transcriber>) -> Self {
        let upload_capacity = config.ingestion.max_concurrent_uploads;
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            hub,
            broker,
            transcriber,
            upload_slots: Arc::new(Semaphore::new(upload_capacity)),
            upload_capacity: Arc::new(AtomicUsize::new(upload_capacity)),
        }
    }

    /// Snapshot of the current configuration. The lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration if it validates.
    ///
    /// `max_concurrent_uploads` cannot shrink a live semaphore, so a lower value
    /// only takes effect after a restart; a higher one adds permits immediately.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let requested = new_config.ingestion.max_concurrent_uploads;
        let granted = self.upload_capacity.fetch_max(requested, Ordering::SeqCst);
        if requested > granted {
            self.upload_slots.add_permits(requested - granted);
        }
        *config = new_config;
        Ok(())
    }

    fn with_metrics(&self, update: impl FnOnce(&mut AppMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let endpoint_metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            endpoint_metric.request_count += 1;
            endpoint_metric.total_duration_ms += duration_ms;
            if is_error {
                endpoint_metric.error_count += 1;
            }
        });
    }

    /// A device session was registered.
    pub fn session_opened(&self) {
        self.with_metrics(|m| {
            m.active_sessions += 1;
            m.sessions_opened += 1;
        });
    }

    /// A device session finished. Never underflows.
    pub fn session_closed(&self) {
        self.with_metrics(|m| {
            m.active_sessions = m.active_sessions.saturating_sub(1);
            m.sessions_closed += 1;
        });
    }

    pub fn transcription_published(&self) {
        self.with_metrics(|m| m.transcriptions_published += 1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
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

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(config: AppConfig) -> AppState {
    use crate::testing::StubTranscriber;

    let (hub, _task) = Hub::start();
    let broker = Arc::new(Broker::new(config.broker.queue_capacity));
    AppState::new(config, hub, broker, Arc::new(StubTranscriber::text("halo dari unggahan")))
}
