use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use metrics::histogram;
use rdkafka::message::Message;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use trinetra_config_data::{parse_travel_matrix_file, TravelMatrix};
use trinetra_event_bus::{build_detections_consumer, EventPublisher};
use trinetra_gallery::{Gallery, GallerySearch};
use trinetra_identity_resolver::gate::SpatiotemporalGate;
use trinetra_identity_resolver::metric_names;
use trinetra_identity_resolver::registry::ActiveIdentityRegistry;
use trinetra_identity_resolver::resolver::IdentityResolver;
use trinetra_types::InferenceEvent;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", default_value = "localhost:9092")]
    kafka_bootstrap_servers: String,

    #[arg(long, env = "KAFKA_CONSUMER_GROUP", default_value = "identity-resolver-group")]
    kafka_consumer_group: String,

    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6334")]
    qdrant_url: String,

    #[arg(long, env = "QDRANT_API_KEY")]
    qdrant_api_key: Option<String>,

    #[arg(long, env = "QDRANT_COLLECTION", default_value = "face_embeddings")]
    qdrant_collection: String,

    /// Minimum cosine similarity for a gallery candidate.
    #[arg(long, env = "COSINE_THRESHOLD", default_value = "0.72")]
    cosine_threshold: f32,

    /// Beyond this many seconds, a transition is treated as a re-entry.
    #[arg(long, env = "TEMPORAL_GATE_WINDOW_S", default_value = "3600")]
    temporal_gate_window_s: f64,

    /// Active-identity TTL in seconds.
    #[arg(long, env = "REGISTRY_TTL_S", default_value = "3600")]
    registry_ttl_s: f64,

    /// Camera travel matrix file. Without one, every camera pair gets the
    /// default minimum travel time.
    #[arg(long, env = "TRAVEL_MATRIX_PATH")]
    travel_matrix_path: Option<std::path::PathBuf>,

    #[arg(long, env = "METRICS_PORT", default_value = "8003")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    trinetra_telemetry::init_logging()?;

    let args = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("resolver-runtime")
        .build()?;

    runtime.block_on(run(args))
}

fn load_matrix(path: &Option<std::path::PathBuf>) -> Result<TravelMatrix> {
    match path {
        Some(path) => parse_travel_matrix_file(path)
            .with_context(|| format!("loading travel matrix {}", path.display())),
        None => Ok(TravelMatrix::default()),
    }
}

async fn run(args: Cli) -> Result<()> {
    trinetra_telemetry::install_metrics(
        ([0, 0, 0, 0], args.metrics_port).into(),
        &[
            (
                metric_names::REID_LATENCY,
                trinetra_telemetry::SERVICE_LATENCY_BUCKETS,
            ),
            (
                metric_names::QDRANT_QUERY_LATENCY,
                trinetra_telemetry::SUBSTAGE_LATENCY_BUCKETS,
            ),
        ],
    )?;

    info!("Identity Resolver starting...");

    let gallery = Gallery::connect(
        &args.qdrant_url,
        args.qdrant_api_key.clone(),
        args.qdrant_collection.clone(),
    )
    .context("connecting to the vector gallery")?;
    gallery
        .ensure_collection()
        .await
        .context("ensuring the gallery collection")?;

    let matrix = load_matrix(&args.travel_matrix_path)?;
    if matrix.is_empty() {
        info!("no travel matrix configured; using the default minimum everywhere");
    }
    let gate = SpatiotemporalGate::new(matrix, args.temporal_gate_window_s);
    let registry = ActiveIdentityRegistry::new(args.registry_ttl_s);
    let mut resolver =
        IdentityResolver::new(gallery, gate, registry, args.cosine_threshold);

    let consumer =
        build_detections_consumer(&args.kafka_bootstrap_servers, &args.kafka_consumer_group)
            .context("creating the detections consumer")?;
    let publisher = EventPublisher::new(&args.kafka_bootstrap_servers)
        .context("creating the event-bus producer")?;

    info!("Consuming from trinetra.detections...");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                // Reload the travel matrix in place; a bad file keeps the
                // running matrix.
                match load_matrix(&args.travel_matrix_path) {
                    Ok(matrix) => {
                        resolver.reload_travel_matrix(matrix);
                        info!("travel matrix reloaded");
                    }
                    Err(e) => warn!("travel matrix reload failed: {e:#}"),
                }
            }
            received = consumer.recv() => {
                let msg = match received {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("kafka error: {e}");
                        continue;
                    }
                };
                let Some(payload) = msg.payload() else { continue };
                let event: InferenceEvent = match serde_json::from_slice(payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("undecodable detection event: {e}");
                        continue;
                    }
                };
                process_event(&mut resolver, &publisher, &event).await;
            }
        }
    }

    info!("identity resolver stopped");
    Ok(())
}

/// Resolve one event and publish the results.
///
/// Publish failures are logged and dropped; the next event proceeds. The
/// consumer's auto-commit means a crash may replay recent events, which the
/// resolution pipeline tolerates (same input, same identity).
async fn process_event<G: GallerySearch>(
    resolver: &mut IdentityResolver<G>,
    publisher: &EventPublisher,
    event: &InferenceEvent,
) {
    let started = Instant::now();
    let (resolved, alert) = resolver.resolve(event).await;

    if let Err(e) = publisher.publish_identity(&resolved).await {
        warn!("identity publish failed for {}: {e}", resolved.camera_id);
    }
    if let Some(alert) = alert {
        if let Err(e) = publisher.publish_alert(&alert).await {
            warn!("alert publish failed for {}: {e}", alert.camera_id);
        }
    }

    histogram!(metric_names::REID_LATENCY).record(started.elapsed().as_secs_f64());
}
