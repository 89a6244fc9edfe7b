//! Capture sources and the blocking reader loop.
//!
//! A capture source yields decoded frames from somewhere slow and flaky (the
//! network). The reader loop owns one source per camera, survives stream
//! loss with exponential backoff, and hands frames to the publisher through
//! the drop-oldest queue.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use metrics::counter;

use trinetra_config_data::CameraConfig;
use trinetra_types::unix_time_now;

use crate::metric_names;
use crate::queue::{CapturedFrame, FrameQueue};

/// Backoff ceiling for stream reopen attempts.
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("unsupported capture source \"{0}\"")]
    UnsupportedSource(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream ended or read failed: {0}")]
    Disconnected(String),
    #[error("frame failed to decode: {0}")]
    CorruptFrame(String),
}

/// A connected stream of decoded frames.
///
/// `read_frame` blocks until the next frame. `Disconnected` means the stream
/// is gone and the caller should reopen; `CorruptFrame` means this one frame
/// was undecodable and the stream is still usable.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Open the capture source configured for a camera.
///
/// `http://` / `https://` sources are MJPEG pulls; `synthetic:` sources
/// generate frames in-process for camera-less development and tests.
pub fn open_source(spec: &str, capture_fps: u32) -> Result<Box<dyn FrameSource>, CaptureError> {
    if spec.starts_with("http://") || spec.starts_with("https://") {
        Ok(Box::new(MjpegSource::connect(spec)?))
    } else if let Some(mode) = spec.strip_prefix("synthetic:") {
        Ok(Box::new(SyntheticSource::new(mode, capture_fps)?))
    } else {
        Err(CaptureError::UnsupportedSource(spec.to_string()))
    }
}

/// MJPEG-over-HTTP capture (`multipart/x-mixed-replace`).
///
/// Frames are located by JPEG SOI/EOI marker scan rather than by multipart
/// boundary parsing; cameras disagree enough about boundary framing that the
/// marker scan is the robust option.
pub struct MjpegSource {
    response: reqwest::blocking::Response,
    buf: Vec<u8>,
}

impl MjpegSource {
    pub fn connect(url: &str) -> Result<Self, CaptureError> {
        let response = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CaptureError::Connect(e.to_string()))?
            .get(url)
            .send()
            .map_err(|e| CaptureError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptureError::Connect(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        Ok(MjpegSource {
            response,
            buf: Vec::with_capacity(64 * 1024),
        })
    }

    /// Pull bytes until the buffer holds one complete JPEG, then cut it out.
    fn next_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if let Some(jpeg) = extract_jpeg(&mut self.buf) {
                return Ok(jpeg);
            }
            let n = self
                .response
                .read(&mut chunk)
                .map_err(|e| CaptureError::Disconnected(e.to_string()))?;
            if n == 0 {
                return Err(CaptureError::Disconnected("EOF".to_string()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl FrameSource for MjpegSource {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let jpeg = self.next_jpeg()?;
        let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .map_err(|e| CaptureError::CorruptFrame(e.to_string()))?;
        Ok(decoded.to_rgb8())
    }
}

/// Cut the first complete `FFD8 … FFD9` span out of `buf`.
///
/// Everything up to the start marker is discarded; everything after the end
/// marker stays buffered for the next frame.
fn extract_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find_marker(buf, &[0xFF, 0xD8])?;
    let end = find_marker(&buf[start + 2..], &[0xFF, 0xD9])? + start + 2;
    let jpeg = buf[start..end + 2].to_vec();
    buf.drain(..end + 2);
    Some(jpeg)
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|w| w[0] == marker[0] && w[1] == marker[1])
}

/// Procedural frame generator, paced at `capture_fps`.
///
/// `synthetic:motion` renders a square orbiting a textured background;
/// `synthetic:still` renders the background only.
pub struct SyntheticSource {
    moving: bool,
    frame_no: u64,
    frame_interval: Duration,
    last_frame: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(mode: &str, capture_fps: u32) -> Result<Self, CaptureError> {
        let moving = match mode {
            "motion" | "" => true,
            "still" => false,
            other => {
                return Err(CaptureError::UnsupportedSource(format!(
                    "synthetic:{other}"
                )))
            }
        };
        Ok(SyntheticSource {
            moving,
            frame_no: 0,
            frame_interval: Duration::from_secs(1) / capture_fps.max(1),
            last_frame: None,
        })
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                std::thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());

        let t = self.frame_no;
        self.frame_no += 1;
        let moving = self.moving;
        let frame = RgbImage::from_fn(640, 480, move |x, y| {
            let base = (((x / 16) + (y / 16)) % 2 * 40 + 60) as u8;
            if moving {
                let cx = 160 + ((t * 8) % 320) as u32;
                let cy = 240;
                let dx = x.abs_diff(cx);
                let dy = y.abs_diff(cy);
                if dx < 40 && dy < 40 {
                    return image::Rgb([230, 230, 230]);
                }
            }
            image::Rgb([base, base, base])
        });
        Ok(frame)
    }
}

/// Blocking per-camera reader loop. Runs on its own thread until `stop` is
/// set or the process exits.
///
/// Reconnect protocol: on stream loss, close, sleep `delay`, reopen. `delay`
/// starts at 1 s, doubles per failed open up to 30 s, and resets on the
/// first successfully read frame. Stream loss is never fatal.
pub fn blocking_reader_loop(config: &CameraConfig, queue: Arc<FrameQueue>, stop: Arc<AtomicBool>) {
    let camera_id = config.id.to_string();
    let mut delay = Duration::from_secs(1);
    let mut source: Option<Box<dyn FrameSource>> = None;

    while !stop.load(Ordering::Relaxed) {
        if source.is_none() {
            match open_source(&config.source, config.capture_fps) {
                Ok(src) => {
                    tracing::info!("connected to stream for {camera_id}");
                    source = Some(src);
                }
                Err(e) => {
                    tracing::warn!(
                        "open failed for {camera_id}: {e}. Retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    counter!(metric_names::STREAM_RECONNECTS, "camera_id" => camera_id.clone())
                        .increment(1);
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(RECONNECT_CEILING);
                    continue;
                }
            }
        }
        let Some(src) = source.as_mut() else {
            continue;
        };

        match src.read_frame() {
            Ok(image) => {
                delay = Duration::from_secs(1);
                let dropped = queue.push(CapturedFrame {
                    image,
                    ingest_ts: unix_time_now(),
                });
                if dropped {
                    counter!(metric_names::FRAMES_DROPPED, "camera_id" => camera_id.clone())
                        .increment(1);
                }
            }
            Err(CaptureError::CorruptFrame(reason)) => {
                tracing::warn!("corrupt frame from {camera_id}: {reason}");
                counter!(metric_names::FRAMES_DROPPED, "camera_id" => camera_id.clone())
                    .increment(1);
            }
            Err(e) => {
                tracing::warn!(
                    "stream lost for {camera_id}: {e}. Reconnecting in {:.1}s",
                    delay.as_secs_f64()
                );
                counter!(metric_names::STREAM_RECONNECTS, "camera_id" => camera_id.clone())
                    .increment(1);
                source = None;
                std::thread::sleep(delay);
                delay = (delay * 2).min(RECONNECT_CEILING);
            }
        }
    }
    tracing::info!("reader for {camera_id} stopped");
}

#[test]
fn test_extract_jpeg_spans() {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"--boundary\r\nContent-Type: image/jpeg\r\n\r\n");
    buf.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    buf.extend_from_slice(b"\r\n--boundary");
    buf.extend_from_slice(&[0xFF, 0xD8, 9]);

    let jpeg = extract_jpeg(&mut buf).unwrap();
    assert_eq!(jpeg, vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
    // Second frame is incomplete: nothing more to extract yet.
    assert!(extract_jpeg(&mut buf).is_none());
    buf.extend_from_slice(&[0xFF, 0xD9]);
    let jpeg = extract_jpeg(&mut buf).unwrap();
    assert_eq!(jpeg, vec![0xFF, 0xD8, 9, 0xFF, 0xD9]);
}

#[test]
fn test_synthetic_source_paces_and_moves() {
    let mut src = SyntheticSource::new("motion", 1000).unwrap();
    let a = src.read_frame().unwrap();
    let b = src.read_frame().unwrap();
    assert_eq!(a.dimensions(), (640, 480));
    // The orbiting square moved between frames.
    assert_ne!(a.as_raw(), b.as_raw());

    let mut still = SyntheticSource::new("still", 1000).unwrap();
    let a = still.read_frame().unwrap();
    let b = still.read_frame().unwrap();
    assert_eq!(a.as_raw(), b.as_raw());
}

#[test]
fn test_unknown_source_rejected() {
    assert!(matches!(
        open_source("rtsp://cam/stream", 30),
        Err(CaptureError::UnsupportedSource(_))
    ));
}
