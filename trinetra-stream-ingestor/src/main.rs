use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use trinetra_config_data::{parse_cameras_file, CamerasConfig};
use trinetra_frame_bus::FrameBus;
use trinetra_stream_ingestor::capture::blocking_reader_loop;
use trinetra_stream_ingestor::http::{self, TaskRegistry};
use trinetra_stream_ingestor::metric_names;
use trinetra_stream_ingestor::publisher::publish_frames;
use trinetra_stream_ingestor::queue::FrameQueue;
use trinetra_stream_ingestor::sampler::AdaptiveFrameSampler;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Camera definitions file.
    #[arg(long, env = "CAMERA_CONFIGS", default_value = "/etc/trinetra/cameras.toml")]
    cameras_file: std::path::PathBuf,

    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Max entries per frame stream; also the in-process queue capacity.
    #[arg(long, env = "FRAME_BUFFER_MAXLEN", default_value = "100")]
    frame_buffer_maxlen: usize,

    /// Default inference FPS for cameras without an explicit target_fps.
    #[arg(long, env = "TARGET_FPS", default_value = "15")]
    target_fps: u32,

    #[arg(long, env = "METRICS_PORT", default_value = "8001")]
    metrics_port: u16,

    /// Address of the health/management HTTP endpoints.
    #[arg(long, env = "INGESTOR_HTTP_ADDR", default_value = "0.0.0.0:8081")]
    http_addr: std::net::SocketAddr,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    trinetra_telemetry::init_logging()?;

    let args = Cli::parse();
    let cfg = parse_cameras_file(&args.cameras_file)
        .with_context(|| format!("loading {}", args.cameras_file.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2 + cfg.cameras.len())
        .thread_name("ingestor-runtime")
        .build()?;

    runtime.block_on(run(args, cfg))
}

async fn run(args: Cli, cfg: CamerasConfig) -> Result<()> {
    trinetra_telemetry::install_metrics(
        ([0, 0, 0, 0], args.metrics_port).into(),
        &[(
            metric_names::FRAME_INGEST_LATENCY,
            trinetra_telemetry::SERVICE_LATENCY_BUCKETS,
        )],
    )?;

    let bus = FrameBus::connect(&args.redis_url)
        .await
        .context("connecting to the frame bus")?;

    let registry = Arc::new(TaskRegistry::default());
    let stop = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("Starting ingestion for {} cameras.", cfg.cameras.len());

    let mut publishers = Vec::new();
    for cam in cfg.cameras {
        let queue = Arc::new(FrameQueue::new(args.frame_buffer_maxlen));
        let sampler = AdaptiveFrameSampler::new(
            cam.capture_fps,
            cam.effective_target_fps(args.target_fps),
        );

        let reader_name = format!("reader-{}", cam.id);
        let reader_guard = registry.register(reader_name.clone());
        let reader_queue = queue.clone();
        let reader_stop = stop.clone();
        let reader_cam = cam.clone();
        std::thread::Builder::new()
            .name(reader_name)
            .spawn(move || {
                let _guard = reader_guard;
                blocking_reader_loop(&reader_cam, reader_queue, reader_stop);
            })
            .context("spawning reader thread")?;

        let publisher_guard = registry.register(format!("publisher-{}", cam.id));
        let publisher_bus = bus.clone();
        let publisher_shutdown = shutdown_rx.clone();
        let maxlen = args.frame_buffer_maxlen;
        publishers.push(tokio::spawn(async move {
            let _guard = publisher_guard;
            publish_frames(cam, sampler, queue, publisher_bus, maxlen, publisher_shutdown).await;
        }));
    }

    let app = http::router(registry.clone());
    let listener = tokio::net::TcpListener::bind(args.http_addr)
        .await
        .with_context(|| format!("binding HTTP endpoint {}", args.http_addr))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server error: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Readers stop refilling; publishers drain what is queued, then exit.
    stop.store(true, Ordering::Relaxed);
    shutdown_tx.send(true).ok();
    for handle in publishers {
        handle.await.ok();
    }
    info!("All camera tasks stopped cleanly.");
    Ok(())
}
