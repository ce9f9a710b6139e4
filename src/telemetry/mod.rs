//! OpenTelemetry-backed tracing setup.
//!
//! Wires `tracing` spans/events into an OTLP exporter when one is
//! configured, and falls back to console-only logging otherwise. Every
//! engine/dispatcher event in this crate goes through the `tracing` macros;
//! this module only decides where those events end up.
//!
//! Configuration is read from the standard OTEL environment variables:
//! - `OTEL_SERVICE_NAME`
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`
//! - `OTEL_TRACES_SAMPLER_ARG` (0.0-1.0)

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. Console-only logging
    /// when unset.
    pub otlp_endpoint: Option<String>,
    /// Fraction of traces collected, 0.0-1.0.
    pub sampling_ratio: f64,
    pub enable_console_logging: bool,
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "shellforge".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }
}

/// Initializes the global tracing subscriber. Returns the OTLP `Tracer`
/// when `config.otlp_endpoint` is set, so the caller can keep a handle
/// around if it ever needs one; `shutdown_telemetry` doesn't need it.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());
        let subscriber = tracing_subscriber::registry().with(env_filter).with(telemetry_layer);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "telemetry initialized with OTLP export"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
        } else {
            subscriber.init();
        }

        tracing::info!("telemetry initialized (console only, no OTLP)");
        Ok(None)
    }
}

fn init_otlp_tracer(service_name: &str, endpoint: &str, sampling_ratio: f64) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint).build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new("service.name", service_name.to_string())])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);
    Ok(tracer)
}

/// Flushes any pending OTLP spans. Must run before process exit or a batch
/// exporter can drop its last batch.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
    tracing::info!("telemetry shut down");
}

/// A span-shaped timing/attribute bag for one dispatched `api` step, used to
/// emit a single structured event per HTTP call the Step Dispatcher makes.
pub mod instrumentation {
    use std::time::Instant;

    #[derive(Debug)]
    pub struct HttpSpanContext {
        pub method: String,
        pub path: String,
        pub start_time: Instant,
        pub status_code: Option<u16>,
        pub duration_ms: Option<u64>,
        pub step_id: String,
        pub step_name: Option<String>,
    }

    impl HttpSpanContext {
        pub fn new(method: &str, path: &str, step_id: &str) -> Self {
            Self {
                method: method.to_string(),
                path: path.to_string(),
                start_time: Instant::now(),
                status_code: None,
                duration_ms: None,
                step_id: step_id.to_string(),
                step_name: None,
            }
        }

        pub fn with_name(mut self, name: &str) -> Self {
            self.step_name = Some(name.to_string());
            self
        }

        pub fn finish(&mut self, status_code: u16) {
            self.status_code = Some(status_code);
            self.duration_ms = Some(self.start_time.elapsed().as_millis() as u64);
        }

        pub fn attributes(&self) -> Vec<(&'static str, String)> {
            let mut attrs = vec![
                ("http.method", self.method.clone()),
                ("http.target", self.path.clone()),
                ("step.id", self.step_id.clone()),
            ];

            if let Some(name) = &self.step_name {
                attrs.push(("step.name", name.clone()));
            }
            if let Some(status) = self.status_code {
                attrs.push(("http.status_code", status.to_string()));
            }
            if let Some(duration) = self.duration_ms {
                attrs.push(("http.duration_ms", duration.to_string()));
            }

            attrs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "shellforge");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert!(config.enable_console_logging);
    }

    #[test]
    fn test_http_span_context() {
        use instrumentation::HttpSpanContext;

        let mut ctx = HttpSpanContext::new("GET", "/api/users", "step-1").with_name("List Users");

        assert_eq!(ctx.method, "GET");
        assert_eq!(ctx.path, "/api/users");
        assert_eq!(ctx.step_id, "step-1");
        assert_eq!(ctx.step_name, Some("List Users".to_string()));
        assert!(ctx.status_code.is_none());

        ctx.finish(200);

        assert_eq!(ctx.status_code, Some(200));
        assert!(ctx.duration_ms.is_some());
    }

    #[test]
    fn test_http_span_attributes() {
        use instrumentation::HttpSpanContext;

        let mut ctx = HttpSpanContext::new("POST", "/api/orders", "step-2");
        ctx.finish(201);

        let attrs = ctx.attributes();

        assert!(attrs.iter().any(|(k, v)| *k == "http.method" && v == "POST"));
        assert!(attrs.iter().any(|(k, v)| *k == "http.target" && v == "/api/orders"));
        assert!(attrs.iter().any(|(k, v)| *k == "http.status_code" && v == "201"));
    }
}
