//! Server state management

use crate::config::ServerConfig;
use crate::inference::{InferenceError, ModelSession};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared server state, cloned into every handler
#[derive(Clone)]
pub struct ServerState {
    /// The one model session for this gateway
    pub session: Arc<ModelSession>,

    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// Metrics collector
    pub metrics: Arc<Metrics>,
}

impl ServerState {
    /// Create server state around an already constructed session
    pub fn new(session: Arc<ModelSession>, config: ServerConfig) -> Self {
        Self {
            session,
            config: Arc::new(config),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Get server metrics
    pub fn get_metrics(&self) -> serde_json::Value {
        self.metrics.snapshot()
    }
}

/// Request counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total queries received
    pub total_requests: AtomicU64,

    /// Queries that ended in an error other than a timeout
    pub failed_requests: AtomicU64,

    /// Queries that ran out of time, inside the session or at the request deadline
    pub timed_out_requests: AtomicU64,

    /// Queries currently waiting for or holding the model
    pub active_queries: AtomicU32,
}

impl Metrics {
    /// Count a new query and track it as active until the guard drops
    pub fn begin_query(&self) -> ActiveQueryGuard<'_> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_queries.fetch_add(1, Ordering::Relaxed);
        ActiveQueryGuard { metrics: self }
    }

    pub fn record_failure(&self, err: &InferenceError) {
        if err.is_timeout() {
            self.record_timeout();
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timed_out_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "failed_requests": self.failed_requests.load(Ordering::Relaxed),
            "timed_out_requests": self.timed_out_requests.load(Ordering::Relaxed),
            "active_queries": self.active_queries.load(Ordering::Relaxed),
        })
    }
}

/// RAII guard for the active query counter
pub struct ActiveQueryGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for ActiveQueryGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active_queries.fetch_sub(1, Ordering::Relaxed);
    }
}
