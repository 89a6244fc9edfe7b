use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics::counter;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use trinetra_event_bus::EventPublisher;
use trinetra_frame_bus::{FrameBus, FrameBusEntry};
use trinetra_inference_worker::batch::MicroBatchAccumulator;
use trinetra_inference_worker::detector::{Detector, OnnxDetector};
use trinetra_inference_worker::embedder::{Embedder, OnnxEmbedder};
use trinetra_inference_worker::gpu::spawn_gpu_poller;
use trinetra_inference_worker::metric_names;
use trinetra_inference_worker::pipeline::run_batch;
use trinetra_types::{frame_stream_name, INFERENCE_GROUP};

/// How long one consumer-group read may block.
const READ_BLOCK_MS: usize = 50;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", default_value = "localhost:9092")]
    kafka_bootstrap_servers: String,

    /// Person detection model (ONNX).
    #[arg(long, env = "YOLO_MODEL_PATH", default_value = "/models/yolov8m.onnx")]
    yolo_model_path: String,

    /// Face embedding model (ONNX).
    #[arg(long, env = "ARCFACE_MODEL_PATH", default_value = "/models/arcface_r50.onnx")]
    arcface_model_path: String,

    /// Micro-batch throughput trigger.
    #[arg(long, env = "BATCH_SIZE", default_value = "4")]
    batch_size: usize,

    /// Micro-batch latency trigger, in milliseconds.
    #[arg(long, env = "BATCH_TIMEOUT_MS", default_value = "20")]
    batch_timeout_ms: u64,

    #[arg(long, env = "METRICS_PORT", default_value = "8002")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    trinetra_telemetry::init_logging()?;

    let args = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-runtime")
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    trinetra_telemetry::install_metrics(
        ([0, 0, 0, 0], args.metrics_port).into(),
        &[
            (
                metric_names::DETECTION_LATENCY,
                trinetra_telemetry::SUBSTAGE_LATENCY_BUCKETS,
            ),
            (
                metric_names::EMBEDDING_LATENCY,
                trinetra_telemetry::SUBSTAGE_LATENCY_BUCKETS,
            ),
        ],
    )?;
    spawn_gpu_poller();

    // Missing model files are the one fatal error class, and only here at
    // startup.
    let mut detector = OnnxDetector::load(&args.yolo_model_path)?;
    let mut embedder = OnnxEmbedder::load(&args.arcface_model_path)?;

    let mut bus = FrameBus::connect(&args.redis_url)
        .await
        .context("connecting to the frame bus")?;
    let publisher = EventPublisher::new(&args.kafka_bootstrap_servers)
        .context("creating the event-bus producer")?;

    let mut streams = bus.discover_streams().await?;
    if streams.is_empty() {
        streams = vec![frame_stream_name(&"cam_default".into())];
    }
    for stream in &streams {
        bus.ensure_group(stream, INFERENCE_GROUP).await?;
    }

    let consumer_name = format!("worker-{}", std::process::id());
    info!("Inference worker {consumer_name} started. Streams: {streams:?}");

    let mut accumulator: MicroBatchAccumulator<FrameBusEntry> = MicroBatchAccumulator::new(
        args.batch_size,
        Duration::from_millis(args.batch_timeout_ms),
    );

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            read = bus.read_group(
                INFERENCE_GROUP,
                &consumer_name,
                &streams,
                args.batch_size,
                READ_BLOCK_MS,
            ) => {
                match read {
                    Ok(entries) => {
                        for entry in entries {
                            accumulator.add(entry);
                        }
                    }
                    Err(e) => {
                        warn!("frame bus read failed: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        if accumulator.is_ready() {
            let batch = accumulator.flush();
            if !batch.is_empty() {
                process_batch(batch, &mut detector, &mut embedder, &publisher, &mut bus).await;
            }
        }
    }

    // Finish the in-flight batch before exiting; anything unacked is
    // redelivered to the next consumer.
    let batch = accumulator.flush();
    if !batch.is_empty() {
        info!("processing final batch of {} entries", batch.len());
        process_batch(batch, &mut detector, &mut embedder, &publisher, &mut bus).await;
    }
    info!("inference worker stopped");
    Ok(())
}

/// Inference, publication, then acks — in that order.
async fn process_batch<D: Detector, E: Embedder>(
    batch: Vec<FrameBusEntry>,
    detector: &mut D,
    embedder: &mut E,
    publisher: &EventPublisher,
    bus: &mut FrameBus,
) {
    let outcome =
        tokio::task::block_in_place(|| run_batch(batch, detector, embedder));

    for entry_ref in outcome.corrupt {
        if let Err(e) = bus.ack(&entry_ref.stream, INFERENCE_GROUP, &entry_ref.id).await {
            warn!("failed to ack corrupt entry {}: {e}", entry_ref.id);
        }
    }

    for (event, entry_ref) in outcome.events {
        match publisher.publish_detections(&event).await {
            Ok(()) => {
                if let Err(e) = bus.ack(&entry_ref.stream, INFERENCE_GROUP, &entry_ref.id).await {
                    warn!("failed to ack entry {}: {e}", entry_ref.id);
                }
            }
            Err(e) => {
                // Leave the entry unacked: it will be redelivered, which is
                // the at-least-once contract.
                counter!(metric_names::KAFKA_PUBLISH_ERRORS).increment(1);
                warn!("event publish failed for {}: {e}", event.camera_id);
            }
        }
    }
}
