use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::routing::RouteTable;
use crate::upstream::{Circuit, Clock, FailoverExecutor, InMemoryCircuitStore, SystemClock};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Built once at startup: the route table, and one circuit per upstream
/// registered in the executor's store before any traffic is served.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub routes: Arc<RouteTable>,
    pub executor: FailoverExecutor<InMemoryCircuitStore>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Result<Self> {
        Self::with_clock(config, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GatewayConfig, metrics: Metrics, clock: Arc<dyn Clock>) -> Result<Self> {
        let routes = RouteTable::new(&config.upstreams)?;
        let executor = FailoverExecutor::with_clock(Arc::new(InMemoryCircuitStore::new()), clock);

        for upstream in &config.upstreams {
            let cb = upstream.effective_circuit_breaker(&config.circuit_breaker);
            executor.add_circuit(
                Circuit::new(upstream.name.as_str())
                    .with_failure_threshold(cb.failure_threshold)
                    .with_retry_timeout(Duration::from_secs(cb.retry_timeout_secs)),
            );
            info!(
                "config: upstream registered, name={}, prefix={}, failure_threshold={}, retry_timeout_secs={}",
                upstream.name,
                upstream.effective_prefix(),
                cb.failure_threshold,
                cb.retry_timeout_secs,
            );
        }
        metrics::gauge!("gateway_config_upstreams_total").set(routes.len() as f64);

        Ok(Self {
            config: Arc::new(config),
            metrics,
            routes: Arc::new(routes),
            executor,
        })
    }
}
