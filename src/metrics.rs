//! Counters, histograms and gauges recorded by the gateway core.
//!
//! Components never talk to Prometheus directly. They receive an
//! `Arc<dyn MetricsRecorder>` at construction and record named events into it;
//! [`GatewayMetrics`] is the Prometheus-backed recorder served on `GET /metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `gateway_requests_total` | Counter | `route` |
//! | `auth_verify_ms` | Histogram | `outcome` |
//! | `receipt_lag_ms` | Histogram | - |
//! | `queue_depth` | Gauge | - |
//! | `queue_enqueued_total` | Counter | `durability` |
//! | `queue_backend_degraded` | Gauge | - |
//! | `settlements_total` | Counter | `outcome` |

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

pub const AUTH_VERIFY_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 20.0, 50.0, 100.0];
pub const RECEIPT_LAG_BUCKETS: &[f64] = &[1.0, 10.0, 50.0, 100.0, 500.0, 1000.0];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Sink for the named measurements the gateway produces.
pub trait MetricsRecorder: Send + Sync {
    fn record_request(&self, route: &str);
    fn record_auth(&self, outcome: &str, elapsed: Duration);
    fn record_receipt_lag(&self, lag: Duration);
    fn set_queue_depth(&self, depth: usize);
    fn record_enqueue(&self, durability: &str);
    fn set_backend_degraded(&self, degraded: bool);
    fn record_settlement(&self, outcome: &str);
}

/// Prometheus-backed [`MetricsRecorder`].
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: CounterVec,
    auth_verify_ms: HistogramVec,
    receipt_lag_ms: Histogram,
    queue_depth: Gauge,
    queue_enqueued_total: CounterVec,
    queue_backend_degraded: Gauge,
    settlements_total: CounterVec,
}

impl GatewayMetrics {
    /// Creates a fresh registry with every gateway metric registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Gateway requests by route"),
            &["route"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let auth_verify_ms = HistogramVec::new(
            HistogramOpts::new("auth_verify_ms", "Auth verification latency in ms")
                .buckets(AUTH_VERIFY_BUCKETS.to_vec()),
            &["outcome"],
        )?;
        registry.register(Box::new(auth_verify_ms.clone()))?;

        let receipt_lag_ms = Histogram::with_opts(
            HistogramOpts::new("receipt_lag_ms", "Receipt processing lag in ms")
                .buckets(RECEIPT_LAG_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(receipt_lag_ms.clone()))?;

        let queue_depth = Gauge::new("queue_depth", "Receipt queue depth")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let queue_enqueued_total = CounterVec::new(
            Opts::new("queue_enqueued_total", "Items enqueued by durability"),
            &["durability"],
        )?;
        registry.register(Box::new(queue_enqueued_total.clone()))?;

        let queue_backend_degraded = Gauge::new(
            "queue_backend_degraded",
            "1 while the durable queue backend is unreachable",
        )?;
        registry.register(Box::new(queue_backend_degraded.clone()))?;

        let settlements_total = CounterVec::new(
            Opts::new("settlements_total", "Drained items handed to settlement"),
            &["outcome"],
        )?;
        registry.register(Box::new(settlements_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            auth_verify_ms,
            receipt_lag_ms,
            queue_depth,
            queue_enqueued_total,
            queue_backend_degraded,
            settlements_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    pub fn queue_depth(&self) -> f64 {
        self.queue_depth.get()
    }

    pub fn request_count(&self, route: &str) -> f64 {
        self.requests_total.with_label_values(&[route]).get()
    }

    pub fn enqueue_count(&self, durability: &str) -> f64 {
        self.queue_enqueued_total
            .with_label_values(&[durability])
            .get()
    }

    pub fn settlement_count(&self, outcome: &str) -> f64 {
        self.settlements_total.with_label_values(&[outcome]).get()
    }

    pub fn receipt_lag_samples(&self) -> u64 {
        self.receipt_lag_ms.get_sample_count()
    }
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl MetricsRecorder for GatewayMetrics {
    fn record_request(&self, route: &str) {
        self.requests_total.with_label_values(&[route]).inc();
    }

    fn record_auth(&self, outcome: &str, elapsed: Duration) {
        self.auth_verify_ms
            .with_label_values(&[outcome])
            .observe(as_millis_f64(elapsed));
    }

    fn record_receipt_lag(&self, lag: Duration) {
        self.receipt_lag_ms.observe(as_millis_f64(lag));
    }

    fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    fn record_enqueue(&self, durability: &str) {
        self.queue_enqueued_total
            .with_label_values(&[durability])
            .inc();
    }

    fn set_backend_degraded(&self, degraded: bool) {
        self.queue_backend_degraded
            .set(if degraded { 1.0 } else { 0.0 });
    }

    fn record_settlement(&self, outcome: &str) {
        self.settlements_total.with_label_values(&[outcome]).inc();
    }
}
