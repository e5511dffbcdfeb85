// Module: Telemetry
// Log and trace output for the agent. One layered subscriber carries it
// all: an env-driven filter, an optional compact console layer, and an
// optional OTLP span layer when an endpoint is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::{info, Level};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to exported spans.
    pub service_name: String,
    /// OTLP gRPC endpoint; None disables span export entirely.
    pub otlp_endpoint: Option<String>,
    /// Fraction of traces to sample, clamped to [0, 1].
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    /// Base log level; RUST_LOG still overrides.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "edge-connector".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Environment takes precedence over defaults: OTEL_SERVICE_NAME,
    /// OTEL_EXPORTER_OTLP_ENDPOINT, OTEL_TRACES_SAMPLER_ARG.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(parsed) = ratio.parse::<f64>() {
                config.sampling_ratio = parsed.clamp(0.0, 1.0);
            }
        }
        config
    }

    fn sampler(&self) -> Sampler {
        match self.sampling_ratio {
            r if r <= 0.0 => Sampler::AlwaysOff,
            r if r >= 1.0 => Sampler::AlwaysOn,
            r => Sampler::TraceIdRatioBased(r),
        }
    }
}

/// Install the global subscriber. Both output layers are optional, so the
/// registry is assembled once instead of per combination. Returns the
/// tracer when span export is active.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let tracer = match &config.otlp_endpoint {
        Some(endpoint) => Some(start_span_pipeline(&config, endpoint)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracer.clone().map(OpenTelemetryLayer::new))
        .with(
            config
                .enable_console_logging
                .then(|| tracing_subscriber::fmt::layer().compact()),
        )
        .init();

    if let Some(endpoint) = &config.otlp_endpoint {
        info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "span export active"
        );
    }
    Ok(tracer)
}

/// Stand up the OTLP batch pipeline on the Tokio runtime and register its
/// provider globally.
fn start_span_pipeline(config: &TelemetryConfig, endpoint: &str) -> anyhow::Result<Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()?;

    let trace_config = sdktrace::Config::default()
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]));

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(trace_config)
        .build();
    let tracer = provider.tracer(config.service_name.clone());
    global::set_tracer_provider(provider);
    Ok(tracer)
}

/// Flush pending spans. Must run before process exit or batched spans are
/// lost.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
