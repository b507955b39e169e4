//! Log and span output for the canary process.
//!
//! Every component logs through `tracing` with structured fields (`namespace`,
//! `shard_key`, `executor_id`, `error`). The subscriber is installed once per
//! process; OTLP span export is added when `OTEL_EXPORTER_OTLP_ENDPOINT` is
//! set, so probe and ping spans can be followed across canary instances.

use std::sync::Once;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use tracing::Instrument;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::settings::LogFormat;

const SERVICE_NAME: &str = "shardcanary";

static INIT: Once = Once::new();

/// `RUST_LOG` if set, otherwise `default`.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn fmt_layer(log_format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    match log_format {
        LogFormat::Text => layer.compact().boxed(),
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
    }
}

/// Install the process-wide subscriber. Later calls are no-ops.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = install(fmt_layer(log_format).with_filter(env_filter("info")).boxed());
    });
    result
}

fn install(fmt: Box<dyn Layer<Registry> + Send + Sync>) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(fmt);

    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        registry.try_init()?;
        return Ok(());
    };

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);
    let pipeline = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(runtime::Tokio);
    match pipeline {
        Ok(tracer) => {
            let otel = tracing_opentelemetry::layer().with_tracer(tracer);
            registry.with(otel).try_init()?;
        }
        Err(err) => {
            // logs still work without span export
            eprintln!("otlp exporter unavailable, logging only: {err}");
            registry.try_init()?;
        }
    }
    Ok(())
}

/// Flush buffered spans before the process exits.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Install a subscriber whose output goes through libtest's capture, quiet
/// unless `RUST_LOG` asks for more.
fn init_for_tests() {
    INIT.call_once(|| {
        let fmt = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .compact()
            .with_filter(env_filter("warn"));
        let _ = tracing_subscriber::registry().with(fmt).try_init();
    });
}

/// Run an async test body inside a span named after the test.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    init_for_tests();
    f().instrument(tracing::info_span!("test", name = test_name))
        .await
}

/// Run a sync test body inside a span named after the test.
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    init_for_tests();
    tracing::info_span!("test", name = test_name).in_scope(f)
}
