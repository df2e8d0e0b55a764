//! Tracing setup shared by every binary.
//!
//! - stdout, always
//! - `<SMOGROUTE_LOG_DIR>/<service>.log` when the variable is set (detached
//!   daemons have no terminal)
//! - OTLP/HTTP span export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//!
//! Filtering follows `RUST_LOG`, defaulting to `info`.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_DIR_ENV: &str = "SMOGROUTE_LOG_DIR";
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Keep alive for the lifetime of the process; dropping it flushes the file
/// writer and the span exporter.
pub struct TracingGuard {
    _file_guard: Option<WorkerGuard>,
    #[cfg(feature = "distributed")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        #[cfg(feature = "distributed")]
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}

pub fn log_file_path(service: &str) -> Option<PathBuf> {
    std::env::var(LOG_DIR_ENV)
        .ok()
        .filter(|d| !d.is_empty())
        .map(|d| PathBuf::from(d).join(format!("{}.log", service)))
}

pub fn init_tracing(service: &str) -> TracingGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let mut file_guard = None;
    let file_layer = log_file_path(service).and_then(|path| {
        let dir = path.parent()?.to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("[{}] cannot create log directory {}: {}", service, dir.display(), e);
            return None;
        }
        let appender = tracing_appender::rolling::never(dir, path.file_name()?);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    });

    #[cfg(feature = "distributed")]
    let (otel_layer, provider) = match otlp_provider(service) {
        Some(provider) => {
            use opentelemetry::trace::TracerProvider;
            let tracer = provider.tracer(service.to_string());
            (Some(tracing_opentelemetry::layer().with_tracer(tracer)), Some(provider))
        }
        None => (None, None),
    };
    #[cfg(not(feature = "distributed"))]
    let otel_layer: Option<tracing_subscriber::layer::Identity> = None;

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    TracingGuard {
        _file_guard: file_guard,
        #[cfg(feature = "distributed")]
        provider,
    }
}

#[cfg(feature = "distributed")]
fn otlp_provider(service: &str) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{Protocol, WithExportConfig};
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let endpoint = std::env::var(OTLP_ENDPOINT_ENV).ok().filter(|e| !e.is_empty())?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(format!("{}/v1/traces", endpoint.trim_end_matches('/')))
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("[{}] OTLP exporter disabled: {}", service, e);
            return None;
        }
    };
    let resource = Resource::builder_empty()
        .with_attributes(vec![KeyValue::new("service.name", service.to_string())])
        .build();
    Some(
        sdktrace::SdkTracerProvider::builder()
            .with_simple_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}
