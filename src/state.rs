//! # Application State Management
//!
//! Shared state handed to every HTTP handler and websocket actor through
//! `web::Data<AppState>`.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//!
//! `parking_lot` locks are used throughout: they cannot be poisoned, so
//! reads and writes need no `unwrap()`.
//!
//! Voice sessions live in the [`SessionRegistry`], which does its own
//! fine-grained locking; `AppState` only keeps a handle to it.

use crate::config::AppConfig;
use crate::persona::PersonaStore;
use crate::session::SessionRegistry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Configuration as last loaded or updated through the config endpoint.
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by the metrics middleware.
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub registry: Arc<SessionRegistry>,

    pub personas: Arc<PersonaStore>,

    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: endpoint name (e.g., "GET /api/v1/characters")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, registry: Arc<SessionRegistry>, personas: Arc<PersonaStore>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            personas,
            start_time: Instant::now(),
        }
    }

    /// A copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Session tuning is read by the registry when it is built, so changes
    /// to the `session`, `audio` and `engines` sections apply after a restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Clone of the metrics, so the lock is not held while a response is
    /// serialised.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
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

    /// Fraction of failed requests, `0.0..=1.0`.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
