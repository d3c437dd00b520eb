use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{TonicExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Config;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

static METER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Keeps the chrome trace writer alive for the process lifetime.
pub struct TelemetryGuards {
    _chrome: Option<FlushGuard>,
}

pub fn init_telemetry(
    endpoint: &Option<String>,
    console: bool,
    trace_local: bool,
) -> TelemetryGuards {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(
        EnvFilter::try_from_default_env()
            .unwrap_or(EnvFilter::new("info"))
            .boxed(),
    );
    if console || endpoint.is_none() {
        layers.push(tracing_subscriber::fmt::layer().boxed());
    }

    let mut chrome_guard = None;
    if trace_local {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        layers.push(chrome_layer.boxed());
        chrome_guard = Some(guard);
    }

    if let Some(endpoint) = endpoint {
        let service_resource = Resource::new(vec![
            KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]);

        let tracer_provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(build_tonic_exporter(endpoint))
            .with_trace_config(Config::default().with_resource(service_resource.clone()))
            .install_batch(runtime::Tokio)
            .context("Failed to install tracer")
            .unwrap();
        let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));

        let meter = opentelemetry_otlp::new_pipeline()
            .metrics(runtime::Tokio)
            .with_exporter(build_tonic_exporter(endpoint))
            .with_resource(service_resource)
            .build()
            .context("Failed to install meter")
            .unwrap();
        METER.set(meter.clone()).unwrap();

        global::set_text_map_propagator(TraceContextPropagator::new());
        layers.push(OpenTelemetryLayer::new(tracer).boxed());
        layers.push(MetricsLayer::new(meter).boxed());
    }

    Registry::default().with(layers).init();

    TelemetryGuards {
        _chrome: chrome_guard,
    }
}

fn build_tonic_exporter(endpoint: &str) -> TonicExporterBuilder {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_timeout(Duration::from_secs(15))
        .with_endpoint(endpoint)
}

pub fn shutdown_meter_provider() {
    if let Some(meter) = METER.get() {
        meter
            .shutdown()
            .context("Failed to shutdown meter provider")
            .unwrap();
    }
}
