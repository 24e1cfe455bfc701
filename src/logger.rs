use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, metrics::SdkMeterProvider};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// `EnvFilter` directive, e.g. `info` or `container_bus=debug,info`.
    pub log_level: String,
    /// Daily-rotated plain text log next to stdout output.
    pub log_file: Option<PathBuf>,
    /// Newline-delimited JSON on stdout instead of the pretty printer.
    pub json: bool,
    /// OTLP/HTTP endpoint for metrics, e.g. `http://localhost:4318/v1/metrics`.
    pub otel_metrics_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            json: false,
            otel_metrics_endpoint: None,
            service_name: "mythic-container".to_string(),
        }
    }
}

/// Keeps the exporters alive; call [`Telemetry::shutdown`] before exit so the
/// last metrics are flushed.
pub struct Telemetry {
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.shutdown() {
                warn!("metric exporter did not shut down cleanly: {err}");
            }
        }
    }
}

/// Installs the global `tracing` subscriber and, when an endpoint is given,
/// the OTLP meter provider the substrate's counters report to.
pub fn init_tracing(options: &LogOptions) -> Result<Telemetry> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if options.json {
        layers.push(fmt::layer().json().with_target(true).boxed());
    } else {
        layers.push(fmt::layer().with_thread_names(true).boxed());
    }

    if let Some(log_file) = &options.log_file {
        let (dir, file_name) = split_log_path(log_file)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
        layers.push(fmt::layer().with_writer(appender).with_ansi(false).boxed());
    }

    let filter = EnvFilter::try_new(&options.log_level)
        .with_context(|| format!("invalid log level `{}`", options.log_level))?
        .add_directive("lapin=warn".parse()?)
        .add_directive("hyper=off".parse()?)
        .add_directive("reqwest=off".parse()?);

    Registry::default()
        .with(layers)
        .with(filter)
        .try_init()
        .context("a tracing subscriber is already installed")?;

    let meter_provider = match &options.otel_metrics_endpoint {
        Some(endpoint) => {
            let provider = init_metrics(endpoint, &options.service_name)?;
            global::set_meter_provider(provider.clone());
            info!("exporting metrics to {endpoint}");
            Some(provider)
        }
        None => None,
    };

    Ok(Telemetry { meter_provider })
}

fn init_metrics(endpoint: &str, service_name: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("metric exporter")?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
        .build())
}

fn split_log_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log file `{}` has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(file_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths() {
        let (dir, file) = split_log_path(Path::new("logs/container.log")).unwrap();
        assert_eq!(dir, PathBuf::from("logs"));
        assert_eq!(file, PathBuf::from("container.log"));

        let (dir, _) = split_log_path(Path::new("container.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));

        assert!(split_log_path(Path::new("logs/..")).is_err());
    }
}
