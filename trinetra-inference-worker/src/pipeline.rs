//! Batch inference pipeline: decode → detect → crop → embed → assemble.
//!
//! Publication and acking stay with the caller so the at-least-once ordering
//! (publish, then ack) is decided in exactly one place.

use std::time::Instant;

use image::RgbImage;
use metrics::{counter, histogram};

use trinetra_frame_bus::FrameBusEntry;
use trinetra_types::{unix_time_now, Detection, FrameEnvelope, InferenceEvent};

use crate::detector::Detector;
use crate::embedder::{self, Embedder};
use crate::metric_names;

/// Frame-bus coordinates of one delivered entry, for acking.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRef {
    pub stream: String,
    pub id: String,
}

/// Result of processing one micro-batch.
pub struct BatchOutcome {
    /// One event per decodable frame, paired with the entry to ack after the
    /// event is published.
    pub events: Vec<(InferenceEvent, EntryRef)>,
    /// Entries to ack immediately: schema or JPEG corruption. Dropping them
    /// is deliberate; redelivery would fail the same way forever.
    pub corrupt: Vec<EntryRef>,
}

/// Run detection and embedding over one micro-batch.
///
/// Every decodable frame yields exactly one event, empty arrays included, and
/// each event's detections and embeddings are aligned 1:1. Detections whose
/// bbox has no positive area carry no face pixels and are dropped to keep
/// that alignment.
pub fn run_batch<D: Detector, E: Embedder>(
    entries: Vec<FrameBusEntry>,
    detector: &mut D,
    embedder: &mut E,
) -> BatchOutcome {
    let mut corrupt = Vec::new();
    let mut frames: Vec<RgbImage> = Vec::new();
    let mut meta: Vec<(FrameEnvelope, EntryRef)> = Vec::new();

    for entry in entries {
        let entry_ref = EntryRef {
            stream: entry.stream,
            id: entry.id,
        };
        let envelope = match entry.envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("malformed frame-bus entry {}: {e} — skipping", entry_ref.id);
                corrupt.push(entry_ref);
                continue;
            }
        };
        match image::load_from_memory_with_format(&envelope.frame, image::ImageFormat::Jpeg) {
            Ok(decoded) => {
                frames.push(decoded.to_rgb8());
                meta.push((envelope, entry_ref));
            }
            Err(e) => {
                tracing::warn!(
                    "corrupted frame from {}: {e} — skipping",
                    envelope.camera_id
                );
                corrupt.push(entry_ref);
            }
        }
    }

    if frames.is_empty() {
        return BatchOutcome {
            events: Vec::new(),
            corrupt,
        };
    }

    let detect_started = Instant::now();
    let batch_detections = detector.detect_batch(&frames);
    histogram!(metric_names::DETECTION_LATENCY).record(detect_started.elapsed().as_secs_f64());

    // Collect croppable detections across the whole batch so the embedder
    // sees one batch, then slice the results back out per frame.
    let mut kept_detections: Vec<Vec<Detection>> = Vec::with_capacity(frames.len());
    let mut all_crops: Vec<RgbImage> = Vec::new();
    let mut crop_counts: Vec<usize> = Vec::with_capacity(frames.len());
    for (frame, detections) in frames.iter().zip(batch_detections) {
        let mut kept = Vec::new();
        let mut count = 0;
        for detection in detections {
            match crop_region(frame, &detection.bbox) {
                Some(crop) => {
                    all_crops.push(crop);
                    kept.push(detection);
                    count += 1;
                }
                None => {
                    tracing::debug!("degenerate bbox {:?} dropped", detection.bbox);
                }
            }
        }
        kept_detections.push(kept);
        crop_counts.push(count);
    }

    let mut embeddings = if all_crops.is_empty() {
        Vec::new()
    } else {
        let embed_started = Instant::now();
        let embeddings = embedder.embed_batch(&all_crops);
        histogram!(metric_names::EMBEDDING_LATENCY).record(embed_started.elapsed().as_secs_f64());
        embeddings
    };
    debug_assert_eq!(embeddings.len(), all_crops.len());

    let mut events = Vec::with_capacity(meta.len());
    let mut embeddings_iter = embeddings.drain(..);
    for ((envelope, entry_ref), (detections, count)) in meta
        .into_iter()
        .zip(kept_detections.into_iter().zip(crop_counts))
    {
        let frame_embeddings: Vec<Vec<f32>> = embeddings_iter.by_ref().take(count).collect();
        counter!(metric_names::FRAMES_PROCESSED, "camera_id" => envelope.camera_id.to_string())
            .increment(1);
        counter!(metric_names::DETECTIONS_TOTAL, "camera_id" => envelope.camera_id.to_string())
            .increment(detections.len() as u64);

        events.push((
            InferenceEvent {
                camera_id: envelope.camera_id,
                camera_type: envelope.camera_type,
                ingest_ts: envelope.ingest_ts,
                worker_ts: unix_time_now(),
                detections,
                embeddings: frame_embeddings,
            },
            entry_ref,
        ));
    }

    BatchOutcome { events, corrupt }
}

/// Cut the bbox region out of the frame and size it for the embedder.
///
/// Returns None when the normalized bbox maps to zero pixels.
fn crop_region(frame: &RgbImage, bbox: &[f32; 4]) -> Option<RgbImage> {
    let (w, h) = frame.dimensions();
    let x1 = (bbox[0].clamp(0.0, 1.0) * w as f32) as u32;
    let y1 = (bbox[1].clamp(0.0, 1.0) * h as f32) as u32;
    let x2 = ((bbox[2].clamp(0.0, 1.0) * w as f32) as u32).min(w);
    let y2 = ((bbox[3].clamp(0.0, 1.0) * h as f32) as u32).min(h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let crop = image::imageops::crop_imm(frame, x1, y1, x2 - x1, y2 - y1).to_image();
    Some(image::imageops::resize(
        &crop,
        embedder::INPUT_SIZE,
        embedder::INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use trinetra_types::{l2_norm, CameraType, EMBEDDING_DIM, PERSON_CLASS_ID};

    /// Deterministic detector: one centered detection per frame, or none.
    struct StubDetector {
        per_frame: Vec<Vec<Detection>>,
    }

    impl Detector for StubDetector {
        fn detect_batch(&mut self, frames: &[RgbImage]) -> Vec<Vec<Detection>> {
            assert_eq!(frames.len(), self.per_frame.len());
            self.per_frame.clone()
        }
    }

    struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn embed_batch(&mut self, crops: &[RgbImage]) -> Vec<Vec<f32>> {
            crops
                .iter()
                .map(|_| {
                    let mut v = vec![0.0; EMBEDDING_DIM];
                    v[0] = 1.0;
                    v
                })
                .collect()
        }
    }

    fn detection(bbox: [f32; 4]) -> Detection {
        Detection {
            track_id: 0,
            bbox,
            confidence: 0.8,
            class_id: PERSON_CLASS_ID,
        }
    }

    fn entry(id: &str, frame: Bytes) -> FrameBusEntry {
        FrameBusEntry {
            stream: "frames:cam_test".to_string(),
            id: id.to_string(),
            envelope: Ok(FrameEnvelope {
                camera_id: "cam_test".into(),
                camera_type: CameraType::Tracking,
                ingest_ts: 100.0,
                frame,
            }),
        }
    }

    fn jpeg_frame() -> Bytes {
        let image = RgbImage::from_pixel(64, 64, image::Rgb([90, 90, 90]));
        let mut jpeg_buf = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_buf, 85);
        encoder
            .encode(image.as_raw(), 64, 64, image::ColorType::Rgb8.into())
            .unwrap();
        Bytes::from(jpeg_buf)
    }

    #[test]
    fn detections_and_embeddings_stay_aligned() {
        let mut detector = StubDetector {
            per_frame: vec![
                vec![
                    detection([0.1, 0.1, 0.5, 0.5]),
                    detection([0.5, 0.5, 0.9, 0.9]),
                ],
                vec![detection([0.2, 0.2, 0.6, 0.6])],
            ],
        };
        let outcome = run_batch(
            vec![entry("1-0", jpeg_frame()), entry("2-0", jpeg_frame())],
            &mut detector,
            &mut StubEmbedder,
        );
        assert_eq!(outcome.events.len(), 2);
        assert!(outcome.corrupt.is_empty());
        for (event, _) in &outcome.events {
            assert!(event.is_aligned());
            assert!(event.worker_ts >= event.ingest_ts);
            for embedding in &event.embeddings {
                assert!((l2_norm(embedding) - 1.0).abs() < 1e-6);
            }
        }
        assert_eq!(outcome.events[0].0.detections.len(), 2);
        assert_eq!(outcome.events[1].0.detections.len(), 1);
    }

    #[test]
    fn empty_detections_yield_empty_event() {
        let mut detector = StubDetector {
            per_frame: vec![vec![]],
        };
        let outcome = run_batch(
            vec![entry("1-0", jpeg_frame())],
            &mut detector,
            &mut StubEmbedder,
        );
        assert_eq!(outcome.events.len(), 1);
        let (event, entry_ref) = &outcome.events[0];
        assert!(event.detections.is_empty());
        assert!(event.embeddings.is_empty());
        assert_eq!(entry_ref.id, "1-0");
    }

    #[test]
    fn degenerate_bbox_is_dropped_to_preserve_alignment() {
        let mut detector = StubDetector {
            per_frame: vec![vec![
                detection([0.4, 0.4, 0.4, 0.4]), // zero area
                detection([0.1, 0.1, 0.3, 0.3]),
            ]],
        };
        let outcome = run_batch(
            vec![entry("1-0", jpeg_frame())],
            &mut detector,
            &mut StubEmbedder,
        );
        let (event, _) = &outcome.events[0];
        assert_eq!(event.detections.len(), 1);
        assert_eq!(event.embeddings.len(), 1);
    }

    #[test]
    fn corrupted_jpeg_is_acked_and_dropped() {
        let mut detector = StubDetector {
            per_frame: vec![vec![]],
        };
        let outcome = run_batch(
            vec![
                entry("1-0", Bytes::from_static(b"not a jpeg")),
                entry("2-0", jpeg_frame()),
            ],
            &mut detector,
            &mut StubEmbedder,
        );
        assert_eq!(outcome.corrupt.len(), 1);
        assert_eq!(outcome.corrupt[0].id, "1-0");
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn malformed_envelope_is_acked_and_dropped() {
        let mut detector = StubDetector {
            per_frame: vec![],
        };
        let outcome = run_batch(
            vec![FrameBusEntry {
                stream: "frames:cam_test".to_string(),
                id: "9-0".to_string(),
                envelope: Err(trinetra_types::EnvelopeError::MissingField("frame")),
            }],
            &mut detector,
            &mut StubEmbedder,
        );
        assert!(outcome.events.is_empty());
        assert_eq!(outcome.corrupt.len(), 1);
    }
}
