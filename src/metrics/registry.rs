use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). LLM-style
/// backends answer slowly, so the tail reaches a minute.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Histogram bucket boundaries for response body size (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Thin handle around the Prometheus recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    /// Fails if a global recorder is already installed.
    pub fn install() -> anyhow::Result<Self> {
        let handle = builder()?.install_recorder()?;
        describe_metrics();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally. Macro calls do not reach
    /// it; used where several gateway states share one process, as in tests.
    pub fn detached() -> anyhow::Result<Self> {
        let recorder = builder()?.build_recorder();
        Ok(Self {
            handle: recorder.handle(),
        })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn builder() -> anyhow::Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("gateway_http_response_size_bytes".to_string()),
            SIZE_BUCKETS,
        )?)
}

fn describe_metrics() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Time spent in the primary and fallback calls"
    );
    describe_gauge!(
        "gateway_http_requests_in_flight",
        Unit::Count,
        "Number of requests currently being processed"
    );
    describe_histogram!(
        "gateway_http_response_size_bytes",
        Unit::Bytes,
        "Response body size in bytes"
    );

    // failover & circuit breaker
    describe_counter!(
        "gateway_failover_fallback_total",
        Unit::Count,
        "Requests served by the fallback, by reason (circuit_open, primary_failed)"
    );
    describe_counter!(
        "gateway_circuit_transitions_total",
        Unit::Count,
        "Circuit state transitions (opened, closed)"
    );
    describe_gauge!(
        "gateway_circuit_open",
        Unit::Count,
        "Circuit state: 1=open 0=closed"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // config
    describe_gauge!(
        "gateway_config_upstreams_total",
        Unit::Count,
        "Number of upstreams currently loaded"
    );
}
