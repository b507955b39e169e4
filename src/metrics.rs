//! Prometheus metrics for the canary.
//!
//! `init()` builds a fresh registry and returns a cloneable [`Metrics`] handle
//! that is threaded through constructors. The registry can be exposed over
//! HTTP with [`run_metrics_server`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Histogram buckets for outbound call latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Canary metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Distributor client metrics
    distributor_requests: CounterVec,
    distributor_request_duration: HistogramVec,

    // Verification metrics
    probes: CounterVec,
    probe_duration: HistogramVec,
    pings_handled: CounterVec,

    // Ownership view metrics
    spectator_refreshes: CounterVec,
    spectator_known_shards: GaugeVec,

    // Executor metrics
    executor_shards_owned: GaugeVec,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one distributor call (a single attempt).
    pub fn record_distributor_request(&self, method: &str, outcome: &str, duration_secs: f64) {
        self.distributor_requests
            .with_label_values(&[method, outcome])
            .inc();
        self.distributor_request_duration
            .with_label_values(&[method])
            .observe(duration_secs);
    }

    /// Record a finished probe. `kind` is "fixed" or "ephemeral".
    pub fn record_probe(&self, namespace: &str, kind: &str, result: &str, duration_secs: f64) {
        self.probes
            .with_label_values(&[namespace, kind, result])
            .inc();
        self.probe_duration
            .with_label_values(&[namespace, kind])
            .observe(duration_secs);
    }

    /// Record an inbound ping answered by this process.
    pub fn record_ping_handled(&self, namespace: &str, owns_shard: bool) {
        let owns = if owns_shard { "true" } else { "false" };
        self.pings_handled.with_label_values(&[namespace, owns]).inc();
    }

    /// Record an ownership view update (or a failed attempt to get one).
    pub fn record_spectator_refresh(&self, namespace: &str, outcome: &str) {
        self.spectator_refreshes
            .with_label_values(&[namespace, outcome])
            .inc();
    }

    /// Update the number of shard keys with a known owner for a namespace.
    pub fn set_spectator_known_shards(&self, namespace: &str, count: usize) {
        self.spectator_known_shards
            .with_label_values(&[namespace])
            .set(count as f64);
    }

    /// Update the number of shard processors running locally for a namespace.
    pub fn set_executor_shards_owned(&self, namespace: &str, count: usize) {
        self.executor_shards_owned
            .with_label_values(&[namespace])
            .set(count as f64);
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to components.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let distributor_requests = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "shardcanary_distributor_requests_total",
                "Total number of shard distributor call attempts",
            ),
            &["method", "outcome"],
        )?,
    );

    let distributor_request_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "shardcanary_distributor_request_duration_seconds",
                "Shard distributor call latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["method"],
        )?,
    );

    let probes = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "shardcanary_probes_total",
                "Total number of ownership probes by result (owned, not_owned, failed)",
            ),
            &["namespace", "kind", "result"],
        )?,
    );

    let probe_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "shardcanary_probe_duration_seconds",
                "Ownership probe latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["namespace", "kind"],
        )?,
    );

    let pings_handled = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "shardcanary_pings_handled_total",
                "Total number of inbound ping requests answered",
            ),
            &["namespace", "owns_shard"],
        )?,
    );

    let spectator_refreshes = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "shardcanary_spectator_refreshes_total",
                "Total number of ownership view updates by outcome",
            ),
            &["namespace", "outcome"],
        )?,
    );

    let spectator_known_shards = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "shardcanary_spectator_known_shards",
                "Number of shard keys with a known owner in the current view",
            ),
            &["namespace"],
        )?,
    );

    let executor_shards_owned = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "shardcanary_executor_shards_owned",
                "Number of shard processors running in this process",
            ),
            &["namespace"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        distributor_requests,
        distributor_request_duration,
        probes,
        probe_duration,
        pings_handled,
        spectator_refreshes,
        spectator_known_shards,
        executor_shards_owned,
    })
}

/// Axum handler for the `/metrics` endpoint.
pub async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Build the router serving `/metrics`.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Run the Prometheus metrics HTTP server until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
