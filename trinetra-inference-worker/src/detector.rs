//! Person detection.
//!
//! The production model is a YOLOv8 head exported to ONNX: input
//! `(B, 3, 640, 640)` RGB normalized to `[0, 1]`, output `(B, 84, 8400)`
//! where rows 0..4 are `cx, cy, w, h` in input pixels and rows 4..84 are
//! per-class confidences. Postprocessing keeps the person class only,
//! applies NMS, and normalizes boxes to `[0, 1]`.

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;

use trinetra_types::{Detection, PERSON_CLASS_ID};

pub const DEFAULT_CONF_THRESHOLD: f32 = 0.35;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
/// Model input edge length.
pub const INPUT_SIZE: u32 = 640;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("loading model \"{path}\" failed: {source}")]
    Load {
        path: String,
        #[source]
        source: ort::Error,
    },
}

/// Batch person detector.
///
/// Infallible by contract: inference errors fail open to empty detection
/// lists so that one bad batch never takes the worker down.
pub trait Detector: Send {
    /// One detection list per input frame, in input order.
    fn detect_batch(&mut self, frames: &[RgbImage]) -> Vec<Vec<Detection>>;
}

pub struct OnnxDetector {
    session: Session,
    input_name: String,
    output_name: String,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl OnnxDetector {
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let session = Session::builder()
            .and_then(|b| b.commit_from_file(path))
            .map_err(|source| ModelError::Load {
                path: path.to_string(),
                source,
            })?;
        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs[0].name.clone();
        tracing::info!("person detection model loaded from {path}");
        Ok(OnnxDetector {
            session,
            input_name,
            output_name,
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// `(B, 3, 640, 640)` float tensor, RGB scaled to `[0, 1]`.
    fn preprocess(frames: &[RgbImage]) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((frames.len(), 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
        for (i, frame) in frames.iter().enumerate() {
            let resized = if frame.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
                std::borrow::Cow::Borrowed(frame)
            } else {
                std::borrow::Cow::Owned(image::imageops::resize(
                    frame,
                    INPUT_SIZE,
                    INPUT_SIZE,
                    image::imageops::FilterType::Triangle,
                ))
            };
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[i, c, y as usize, x as usize]] = pixel.0[c] as f32 / 255.0;
                }
            }
        }
        tensor
    }

    fn run(&mut self, frames: &[RgbImage]) -> Result<Vec<Vec<Detection>>, ort::Error> {
        let tensor = Self::preprocess(frames);
        let inputs = ort::inputs![self.input_name.as_str() => tensor.view()]?;
        let outputs = self.session.run(inputs)?;
        let raw = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        if raw.ndim() != 3 || raw.shape()[1] <= 4 + PERSON_CLASS_ID as usize {
            tracing::error!("unexpected detector output shape {:?}", raw.shape());
            return Ok(vec![Vec::new(); frames.len()]);
        }

        let mut per_frame = Vec::with_capacity(frames.len());
        for i in 0..frames.len() {
            let mut candidates = Vec::new();
            let anchors = raw.shape()[2];
            for a in 0..anchors {
                let score = raw[[i, 4 + PERSON_CLASS_ID as usize, a]];
                if score <= self.conf_threshold {
                    continue;
                }
                let cx = raw[[i, 0, a]] / INPUT_SIZE as f32;
                let cy = raw[[i, 1, a]] / INPUT_SIZE as f32;
                let w = raw[[i, 2, a]] / INPUT_SIZE as f32;
                let h = raw[[i, 3, a]] / INPUT_SIZE as f32;
                let bbox = [
                    (cx - w / 2.0).clamp(0.0, 1.0),
                    (cy - h / 2.0).clamp(0.0, 1.0),
                    (cx + w / 2.0).clamp(0.0, 1.0),
                    (cy + h / 2.0).clamp(0.0, 1.0),
                ];
                candidates.push((bbox, score));
            }
            per_frame.push(
                nms(candidates, self.iou_threshold)
                    .into_iter()
                    .map(|(bbox, confidence)| Detection {
                        track_id: 0,
                        bbox,
                        confidence,
                        class_id: PERSON_CLASS_ID,
                    })
                    .collect(),
            );
        }
        Ok(per_frame)
    }
}

impl Detector for OnnxDetector {
    fn detect_batch(&mut self, frames: &[RgbImage]) -> Vec<Vec<Detection>> {
        if frames.is_empty() {
            return Vec::new();
        }
        match self.run(frames) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::error!("detection inference failed: {e}");
                vec![Vec::new(); frames.len()]
            }
        }
    }
}

/// Greedy non-maximum suppression. Keeps the highest-scoring box of each
/// overlapping cluster, in descending score order.
pub fn nms(mut candidates: Vec<([f32; 4], f32)>, iou_threshold: f32) -> Vec<([f32; 4], f32)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<([f32; 4], f32)> = Vec::new();
    for (bbox, score) in candidates {
        if kept.iter().all(|(k, _)| iou(k, &bbox) <= iou_threshold) {
            kept.push((bbox, score));
        }
    }
    kept
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[test]
fn test_iou_disjoint_and_identical() {
    let a = [0.0, 0.0, 0.5, 0.5];
    let b = [0.6, 0.6, 0.9, 0.9];
    assert_eq!(iou(&a, &b), 0.0);
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
}

#[test]
fn test_nms_collapses_overlaps() {
    let candidates = vec![
        ([0.10, 0.10, 0.50, 0.50], 0.9),
        ([0.12, 0.11, 0.52, 0.51], 0.8), // overlaps the first
        ([0.70, 0.70, 0.90, 0.90], 0.7), // disjoint
    ];
    let kept = nms(candidates, DEFAULT_IOU_THRESHOLD);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].1, 0.9);
    assert_eq!(kept[1].1, 0.7);
}

#[test]
fn test_nms_orders_by_score() {
    let candidates = vec![
        ([0.7, 0.7, 0.9, 0.9], 0.4),
        ([0.1, 0.1, 0.3, 0.3], 0.95),
    ];
    let kept = nms(candidates, DEFAULT_IOU_THRESHOLD);
    assert_eq!(kept[0].1, 0.95);
    assert_eq!(kept[1].1, 0.4);
}
