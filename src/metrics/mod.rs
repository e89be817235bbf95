// Prometheus metrics for the query observability engine
//
// Counters only; latency of the instrumented queries is already carried in
// the log records. Metrics live in a private registry so a host that
// registers the same names in the default registry never conflicts with
// them; hosts expose it through `registry()` or `export_prometheus()`.

use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::alert::AlertKind;

pub struct QueryLensMetrics {
    registry: Registry,

    /// Queries that reached the tracker
    pub queries_tracked: IntCounter,

    /// Queries skipped by the sampling gate
    pub queries_sampled_out: IntCounter,

    /// Queries dropped by the exclusion filter or plan-statement check
    pub queries_excluded: IntCounter,

    /// Queries classified slow
    pub slow_queries: IntCounter,

    /// N+1 patterns detected (counted once per pattern per request)
    pub n_plus_one_detected: IntCounter,

    /// Records that could not be persisted
    pub store_failures: IntCounter,

    /// Records dropped because the store writer queue was full
    pub store_dropped: IntCounter,

    /// Alerts raised, by kind
    pub alerts: IntCounterVec,

    /// Webhook deliveries that failed or were dropped
    pub webhook_failures: IntCounter,

    /// Queries per finished request
    pub queries_per_request: Histogram,
}

static METRICS: OnceLock<QueryLensMetrics> = OnceLock::new();

/// Add `metric` to `registry`; a failure leaves the metric usable but
/// unexported
fn register<C>(registry: &Registry, metric: C) -> C
where
    C: Collector + Clone + 'static,
{
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::error!(error = %e, "Failed to register metric");
    }
    metric
}

impl QueryLensMetrics {
    /// Initialize and return the global metrics instance
    pub fn global() -> &'static Self {
        METRICS.get_or_init(Self::new)
    }

    fn new() -> Self {
        let registry = Registry::new();

        let queries = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "querylens_queries_total",
                    "Queries seen by the engine, by outcome",
                ),
                &["outcome"], // tracked, sampled_out, excluded, slow
            )
            .expect("valid querylens_queries_total options"),
        );

        let n_plus_one_detected = register(
            &registry,
            IntCounter::new(
                "querylens_n_plus_one_detected_total",
                "N+1 query patterns detected",
            )
            .expect("valid querylens_n_plus_one_detected_total options"),
        );

        let failures = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "querylens_sink_failures_total",
                    "Failures writing to downstream sinks",
                ),
                &["sink"], // store, store_queue, webhook
            )
            .expect("valid querylens_sink_failures_total options"),
        );

        let alerts = register(
            &registry,
            IntCounterVec::new(
                Opts::new("querylens_alerts_total", "Alerts raised by kind"),
                &["kind"],
            )
            .expect("valid querylens_alerts_total options"),
        );

        let queries_per_request = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "querylens_queries_per_request",
                    "Number of queries issued per finished request",
                )
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
            )
            .expect("valid querylens_queries_per_request options"),
        );

        QueryLensMetrics {
            queries_tracked: queries.with_label_values(&["tracked"]),
            queries_sampled_out: queries.with_label_values(&["sampled_out"]),
            queries_excluded: queries.with_label_values(&["excluded"]),
            slow_queries: queries.with_label_values(&["slow"]),
            n_plus_one_detected,
            store_failures: failures.with_label_values(&["store"]),
            store_dropped: failures.with_label_values(&["store_queue"]),
            alerts,
            webhook_failures: failures.with_label_values(&["webhook"]),
            queries_per_request,
            registry,
        }
    }

    /// Registry holding every querylens metric
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_alert(&self, kind: AlertKind) {
        self.alerts.with_label_values(&[kind.as_str()]).inc();
    }

    /// Render the querylens registry in the Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
