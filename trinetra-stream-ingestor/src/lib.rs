//! Stream ingestor.
//!
//! One blocking reader thread and one cooperative publisher task per camera.
//! The reader pulls frames from the capture source into a small drop-oldest
//! queue; the publisher drains the queue, applies the adaptive sampling
//! decision, and appends JPEG frames to the frame bus. Backpressure shows up
//! as counted drops, never as a stalled reader.

pub mod capture;
pub mod http;
pub mod motion;
pub mod publisher;
pub mod queue;
pub mod sampler;

/// Metric names exported by this service.
pub mod metric_names {
    pub const FRAMES_INGESTED: &str = "trinetra_ingestor_frames_total";
    pub const FRAMES_DROPPED: &str = "trinetra_ingestor_frames_dropped_total";
    pub const STREAM_RECONNECTS: &str = "trinetra_ingestor_reconnects_total";
    pub const FRAME_INGEST_LATENCY: &str = "trinetra_ingestor_frame_latency_seconds";
    pub const REDIS_STREAM_LENGTH: &str = "trinetra_redis_stream_length";
}
