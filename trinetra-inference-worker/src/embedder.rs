//! Face embedding.
//!
//! ArcFace (ResNet-50 backbone) exported to ONNX: input `(B, 3, 112, 112)`
//! RGB normalized to `[-1, 1]` (the InsightFace convention, `(px-127.5)/127.5`
//! — not ImageNet normalization; using the wrong one silently degrades
//! embedding quality), output `(B, 512)` which is L2-normalized here.

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;

use trinetra_types::EMBEDDING_DIM;

use crate::detector::ModelError;

/// Crop edge length expected by the model.
pub const INPUT_SIZE: u32 = 112;
/// VRAM cap: crowded frames are embedded in sub-batches of at most this many
/// crops.
pub const MAX_SUB_BATCH: usize = 16;

/// Batch face embedder.
///
/// Returns exactly one 512-dim vector per crop. Sub-batch inference failures
/// substitute zero vectors instead of aborting the batch.
pub trait Embedder: Send {
    fn embed_batch(&mut self, crops: &[RgbImage]) -> Vec<Vec<f32>>;
}

pub struct OnnxEmbedder {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxEmbedder {
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let session = Session::builder()
            .and_then(|b| b.commit_from_file(path))
            .map_err(|source| ModelError::Load {
                path: path.to_string(),
                source,
            })?;
        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs[0].name.clone();
        tracing::info!("face embedding model loaded from {path}");
        Ok(OnnxEmbedder {
            session,
            input_name,
            output_name,
        })
    }

    fn preprocess(crops: &[RgbImage]) -> Array4<f32> {
        let size = INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((crops.len(), 3, size, size));
        for (i, crop) in crops.iter().enumerate() {
            let resized = if crop.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
                std::borrow::Cow::Borrowed(crop)
            } else {
                std::borrow::Cow::Owned(image::imageops::resize(
                    crop,
                    INPUT_SIZE,
                    INPUT_SIZE,
                    image::imageops::FilterType::Triangle,
                ))
            };
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[i, c, y as usize, x as usize]] =
                        (pixel.0[c] as f32 - 127.5) / 127.5;
                }
            }
        }
        tensor
    }

    fn run_sub_batch(&mut self, crops: &[RgbImage]) -> Result<Vec<Vec<f32>>, ort::Error> {
        let tensor = Self::preprocess(crops);
        let inputs = ort::inputs![self.input_name.as_str() => tensor.view()]?;
        let outputs = self.session.run(inputs)?;
        let raw = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        if raw.ndim() != 2 || raw.shape()[0] != crops.len() {
            tracing::error!("unexpected embedder output shape {:?}", raw.shape());
            return Ok(vec![vec![0.0; EMBEDDING_DIM]; crops.len()]);
        }
        Ok((0..crops.len())
            .map(|i| {
                let row: Vec<f32> = raw
                    .index_axis(ndarray::Axis(0), i)
                    .iter()
                    .copied()
                    .collect();
                l2_normalize(row)
            })
            .collect())
    }
}

impl Embedder for OnnxEmbedder {
    fn embed_batch(&mut self, crops: &[RgbImage]) -> Vec<Vec<f32>> {
        let mut all = Vec::with_capacity(crops.len());
        for sub in crops.chunks(MAX_SUB_BATCH) {
            match self.run_sub_batch(sub) {
                Ok(embeddings) => all.extend(embeddings),
                Err(e) => {
                    tracing::error!("embedding inference failed on sub-batch: {e}");
                    all.extend(std::iter::repeat_with(|| vec![0.0; EMBEDDING_DIM]).take(sub.len()));
                }
            }
        }
        all
    }
}

/// L2-normalize a vector. Required for cosine similarity downstream.
///
/// The epsilon keeps all-zero vectors (the failure substitute) at zero
/// instead of dividing by zero.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt() + 1e-8;
    for x in &mut v {
        *x /= norm;
    }
    v
}

#[test]
fn test_l2_normalize_unit_norm() {
    let v = l2_normalize(vec![3.0, 4.0]);
    let norm = (v[0] * v[0] + v[1] * v[1]).sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
    assert!((v[0] - 0.6).abs() < 1e-5);
}

#[test]
fn test_l2_normalize_zero_vector_stays_zero() {
    let v = l2_normalize(vec![0.0; 8]);
    assert!(v.iter().all(|x| *x == 0.0));
}
