//! Logging and metrics bootstrap, shared by all three services.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use tracing_subscriber::{fmt, layer::SubscriberExt};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("setting global tracing subscriber failed: {source}")]
    SetSubscriber {
        #[from]
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[error("installing Prometheus exporter failed: {source}")]
    Exporter {
        #[from]
        source: BuildError,
    },
}

/// Buckets for service-level latency histograms (5 ms – 500 ms).
pub const SERVICE_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5];

/// Buckets for inference sub-stage histograms (1 ms – 50 ms).
pub const SUBSTAGE_LATENCY_BUCKETS: &[f64] = &[0.001, 0.002, 0.005, 0.01, 0.025, 0.05];

/// Start logging to console, filtered by `RUST_LOG`.
pub fn init_logging() -> Result<(), Error> {
    let console_layer = fmt::layer().with_file(true).with_line_number(true);

    let collector = tracing_subscriber::registry()
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;

    let log_var = if let Ok(var) = std::env::var("RUST_LOG") {
        format!(" with RUST_LOG=\"{}\".", var)
    } else {
        ".".to_string()
    };
    tracing::debug!("Logging initiated to console{log_var}");
    Ok(())
}

/// Install the Prometheus text-format exporter on `addr`.
///
/// `histograms` lists each histogram the service records, paired with its
/// bucket layout; everything not listed falls back to the exporter's summary
/// representation. Must run inside a tokio runtime.
pub fn install_metrics(
    addr: SocketAddr,
    histograms: &[(&str, &[f64])],
) -> Result<(), Error> {
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (name, buckets) in histograms {
        builder = builder.set_buckets_for_metric(Matcher::Full(name.to_string()), buckets)?;
    }
    builder.install()?;
    tracing::info!("Prometheus metrics exporter listening on {addr}");
    Ok(())
}
