//! Per-camera publisher task: queue → sample → encode → frame bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::RgbImage;
use metrics::{counter, gauge, histogram};
use tokio::sync::watch;

use trinetra_config_data::CameraConfig;
use trinetra_frame_bus::FrameBus;
use trinetra_types::{frame_stream_name, FrameEnvelope};

use crate::metric_names;
use crate::queue::FrameQueue;
use crate::sampler::AdaptiveFrameSampler;

/// Inference resolution; frames are resized before serialization so that
/// consumers never see the capture resolution.
const PUBLISH_SIZE: u32 = 640;
/// JPEG quality: balances payload size against model accuracy impact.
const JPEG_QUALITY: u8 = 85;
/// How long one queue wait may block before rechecking shutdown.
const QUEUE_WAIT: Duration = Duration::from_secs(1);
/// Deadline for draining the queue on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Resize to the publish resolution and JPEG-encode.
pub fn encode_frame(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let resized = if image.dimensions() == (PUBLISH_SIZE, PUBLISH_SIZE) {
        std::borrow::Cow::Borrowed(image)
    } else {
        std::borrow::Cow::Owned(image::imageops::resize(
            image,
            PUBLISH_SIZE,
            PUBLISH_SIZE,
            image::imageops::FilterType::Triangle,
        ))
    };
    let mut jpeg_buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_buf, JPEG_QUALITY);
    encoder.encode(
        resized.as_raw(),
        PUBLISH_SIZE,
        PUBLISH_SIZE,
        image::ColorType::Rgb8.into(),
    )?;
    Ok(jpeg_buf)
}

/// Drain the camera's queue into the frame bus until shutdown.
///
/// Bus failures are not fatal: the affected frame is counted as dropped and
/// the loop moves on to the next one. On shutdown the queue is drained to
/// empty or to a deadline, whichever comes first.
pub async fn publish_frames(
    config: CameraConfig,
    mut sampler: AdaptiveFrameSampler,
    queue: Arc<FrameQueue>,
    mut bus: FrameBus,
    maxlen: usize,
    shutdown: watch::Receiver<bool>,
) {
    let stream = frame_stream_name(&config.id);
    let camera_id = config.id.to_string();
    let camera_type = config.camera_type.as_str();
    let mut drain_started: Option<Instant> = None;

    loop {
        if *shutdown.borrow() && drain_started.is_none() {
            drain_started = Some(Instant::now());
        }
        if let Some(started) = drain_started {
            if queue.is_empty() || started.elapsed() > DRAIN_DEADLINE {
                break;
            }
        }

        let Some(frame) = queue.pop_timeout(QUEUE_WAIT).await else {
            continue;
        };

        let publish_started = Instant::now();

        let fill_pct = match bus.len(&stream).await {
            Ok(len) => {
                gauge!(metric_names::REDIS_STREAM_LENGTH, "camera_id" => camera_id.clone())
                    .set(len as f64);
                (len as f32 / maxlen as f32) * 100.0
            }
            Err(e) => {
                tracing::warn!("frame bus length check failed for {camera_id}: {e}");
                counter!(metric_names::FRAMES_DROPPED, "camera_id" => camera_id.clone())
                    .increment(1);
                continue;
            }
        };

        if !sampler.should_forward(&frame.image, fill_pct) {
            counter!(metric_names::FRAMES_DROPPED, "camera_id" => camera_id.clone()).increment(1);
            continue;
        }

        let jpeg = match encode_frame(&frame.image) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!("JPEG encode failed for {camera_id}: {e}");
                counter!(metric_names::FRAMES_DROPPED, "camera_id" => camera_id.clone())
                    .increment(1);
                continue;
            }
        };

        let envelope = FrameEnvelope {
            camera_id: config.id.clone(),
            camera_type: config.camera_type,
            ingest_ts: frame.ingest_ts,
            frame: Bytes::from(jpeg),
        };

        match bus.append(&stream, &envelope, maxlen).await {
            Ok(_id) => {
                histogram!(metric_names::FRAME_INGEST_LATENCY)
                    .record(publish_started.elapsed().as_secs_f64());
                counter!(
                    metric_names::FRAMES_INGESTED,
                    "camera_id" => camera_id.clone(),
                    "camera_type" => camera_type
                )
                .increment(1);
            }
            Err(e) => {
                tracing::warn!("frame bus append failed for {camera_id}: {e}");
                counter!(metric_names::FRAMES_DROPPED, "camera_id" => camera_id.clone())
                    .increment(1);
            }
        }
    }

    tracing::info!("publisher for {camera_id} stopped");
}

#[test]
fn test_encode_frame_is_640_jpeg() {
    let image = RgbImage::from_pixel(320, 240, image::Rgb([10, 200, 30]));
    let jpeg = encode_frame(&image).unwrap();
    assert_eq!(jpeg[..2], [0xFF, 0xD8]);
    let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
    assert_eq!(decoded.width(), PUBLISH_SIZE);
    assert_eq!(decoded.height(), PUBLISH_SIZE);
}
