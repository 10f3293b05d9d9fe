//! Prometheus metrics for invalidations and control terminal health

use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramOpts, HistogramVec, Opts,
    Registry,
};
use std::sync::Arc;

const DURATION_BUCKETS: [f64; 10] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// Metrics for purge operations
#[derive(Clone)]
pub struct PurgeMetrics {
    /// Invalidations requested, by kind (tag, url)
    pub purge_requests_total: Arc<CounterVec>,

    /// Invalidations by kind and overall result
    pub purge_results_total: Arc<CounterVec>,

    /// Ban results per control terminal
    pub backend_results_total: Arc<CounterVec>,

    /// Time spent fanning a ban out to every terminal
    pub purge_duration_seconds: Arc<HistogramVec>,

    /// Rejected HTTP purge requests, by reason
    pub purge_auth_failures_total: Arc<CounterVec>,

    /// Control terminals that could not be reached
    pub backend_unreachable_total: Arc<CounterVec>,
}

impl PurgeMetrics {
    /// Create metrics in the default registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let purge_requests_total = register_counter_vec!(
            "adv_varnish_purge_requests_total",
            "Total number of invalidation requests",
            &["kind"]
        )?;

        let purge_results_total = register_counter_vec!(
            "adv_varnish_purge_results_total",
            "Total number of invalidations by result",
            &["kind", "result"]
        )?;

        let backend_results_total = register_counter_vec!(
            "adv_varnish_backend_results_total",
            "Ban results per control terminal",
            &["backend", "result"]
        )?;

        let purge_duration_seconds = register_histogram_vec!(
            "adv_varnish_purge_duration_seconds",
            "Duration of invalidation fan-out in seconds",
            &["kind"],
            DURATION_BUCKETS.to_vec()
        )?;

        let purge_auth_failures_total = register_counter_vec!(
            "adv_varnish_purge_auth_failures_total",
            "Total number of rejected purge requests",
            &["reason"]
        )?;

        let backend_unreachable_total = register_counter_vec!(
            "adv_varnish_backend_unreachable_total",
            "Total number of times a control terminal could not be reached",
            &["backend"]
        )?;

        Ok(Self {
            purge_requests_total: Arc::new(purge_requests_total),
            purge_results_total: Arc::new(purge_results_total),
            backend_results_total: Arc::new(backend_results_total),
            purge_duration_seconds: Arc::new(purge_duration_seconds),
            purge_auth_failures_total: Arc::new(purge_auth_failures_total),
            backend_unreachable_total: Arc::new(backend_unreachable_total),
        })
    }

    /// Create metrics in a caller-owned registry
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<CounterVec, prometheus::Error> {
            let vec = CounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let purge_requests_total = counter(
            "adv_varnish_purge_requests_total",
            "Total number of invalidation requests",
            &["kind"],
        )?;
        let purge_results_total = counter(
            "adv_varnish_purge_results_total",
            "Total number of invalidations by result",
            &["kind", "result"],
        )?;
        let backend_results_total = counter(
            "adv_varnish_backend_results_total",
            "Ban results per control terminal",
            &["backend", "result"],
        )?;
        let purge_auth_failures_total = counter(
            "adv_varnish_purge_auth_failures_total",
            "Total number of rejected purge requests",
            &["reason"],
        )?;
        let backend_unreachable_total = counter(
            "adv_varnish_backend_unreachable_total",
            "Total number of times a control terminal could not be reached",
            &["backend"],
        )?;

        let purge_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "adv_varnish_purge_duration_seconds",
                "Duration of invalidation fan-out in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["kind"],
        )?;
        registry.register(Box::new(purge_duration_seconds.clone()))?;

        Ok(Self {
            purge_requests_total: Arc::new(purge_requests_total),
            purge_results_total: Arc::new(purge_results_total),
            backend_results_total: Arc::new(backend_results_total),
            purge_duration_seconds: Arc::new(purge_duration_seconds),
            purge_auth_failures_total: Arc::new(purge_auth_failures_total),
            backend_unreachable_total: Arc::new(backend_unreachable_total),
        })
    }

    pub fn record_request(&self, kind: &str) {
        self.purge_requests_total.with_label_values(&[kind]).inc();
    }

    pub fn record_result(&self, kind: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.purge_results_total
            .with_label_values(&[kind, result])
            .inc();
    }

    /// Record the ban result reported by one terminal
    pub fn record_backend_result(&self, backend: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.backend_results_total
            .with_label_values(&[backend, result])
            .inc();
    }

    pub fn record_duration(&self, kind: &str, duration_secs: f64) {
        self.purge_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// reason: missing_token, invalid_token
    pub fn record_auth_failure(&self, reason: &str) {
        self.purge_auth_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_unreachable(&self, backend: &str) {
        self.backend_unreachable_total
            .with_label_values(&[backend])
            .inc();
    }
}
