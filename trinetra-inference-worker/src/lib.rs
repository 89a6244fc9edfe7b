//! Inference worker.
//!
//! Joins the frame-bus consumer group, forms micro-batches across cameras,
//! runs person detection and face embedding, publishes one event per frame
//! to the event bus, and acks frame-bus entries only after the event bus has
//! accepted the event (at-least-once).

pub mod batch;
pub mod detector;
pub mod embedder;
pub mod gpu;
pub mod pipeline;

/// Metric names exported by this service.
pub mod metric_names {
    pub const DETECTION_LATENCY: &str = "trinetra_detection_latency_seconds";
    pub const EMBEDDING_LATENCY: &str = "trinetra_embedding_latency_seconds";
    pub const FRAMES_PROCESSED: &str = "trinetra_worker_frames_processed_total";
    pub const DETECTIONS_TOTAL: &str = "trinetra_detections_total";
    pub const KAFKA_PUBLISH_ERRORS: &str = "trinetra_kafka_publish_errors_total";
    pub const GPU_UTILIZATION: &str = "trinetra_gpu_utilization_pct";
    pub const GPU_VRAM_USED_MB: &str = "trinetra_gpu_vram_used_mb";
}
