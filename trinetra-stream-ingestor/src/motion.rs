//! Coarse motion estimation between consecutive frames.
//!
//! The sampler only needs a scalar "how much is moving" signal, so frames
//! are reduced to a small grayscale raster and a block-matching search
//! produces one displacement vector per block. The reported value is the
//! mean displacement magnitude in downscaled pixels.

use image::{imageops, GrayImage, RgbImage};

/// Side length of the downscaled raster the search runs on.
const ANALYSIS_SIZE: u32 = 160;
/// Side length of one matching block.
const BLOCK: u32 = 16;
/// Maximum displacement searched in each direction.
const SEARCH_RADIUS: i32 = 6;

pub struct MotionEstimator {
    prev: Option<GrayImage>,
}

impl MotionEstimator {
    pub fn new() -> Self {
        MotionEstimator { prev: None }
    }

    /// Mean flow magnitude of `frame` against the previously supplied frame.
    ///
    /// Returns 0.0 for the first frame. The previous-frame state advances on
    /// every call, so callers decide when motion is worth measuring.
    pub fn update(&mut self, frame: &RgbImage) -> f32 {
        let gray = downscale_gray(frame);
        let magnitude = match &self.prev {
            None => 0.0,
            Some(prev) => mean_flow_magnitude(prev, &gray),
        };
        self.prev = Some(gray);
        magnitude
    }
}

impl Default for MotionEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn downscale_gray(frame: &RgbImage) -> GrayImage {
    let gray = imageops::grayscale(frame);
    imageops::resize(
        &gray,
        ANALYSIS_SIZE,
        ANALYSIS_SIZE,
        imageops::FilterType::Triangle,
    )
}

/// Mean displacement magnitude over all blocks.
fn mean_flow_magnitude(prev: &GrayImage, cur: &GrayImage) -> f32 {
    let mut total = 0.0f32;
    let mut blocks = 0u32;
    let mut by = 0;
    while by + BLOCK <= ANALYSIS_SIZE {
        let mut bx = 0;
        while bx + BLOCK <= ANALYSIS_SIZE {
            let (dx, dy) = best_displacement(prev, cur, bx, by);
            total += ((dx * dx + dy * dy) as f32).sqrt();
            blocks += 1;
            bx += BLOCK;
        }
        by += BLOCK;
    }
    if blocks == 0 {
        0.0
    } else {
        total / blocks as f32
    }
}

/// Two-pass block search: coarse stride 2, then refine stride 1 around the
/// coarse winner.
fn best_displacement(prev: &GrayImage, cur: &GrayImage, bx: u32, by: u32) -> (i32, i32) {
    let mut best = (0i32, 0i32);
    let mut best_cost = sad(prev, cur, bx, by, 0, 0).unwrap_or(u32::MAX);

    let mut dy = -SEARCH_RADIUS;
    while dy <= SEARCH_RADIUS {
        let mut dx = -SEARCH_RADIUS;
        while dx <= SEARCH_RADIUS {
            if let Some(cost) = sad(prev, cur, bx, by, dx, dy) {
                if cost < best_cost {
                    best_cost = cost;
                    best = (dx, dy);
                }
            }
            dx += 2;
        }
        dy += 2;
    }

    let (cx, cy) = best;
    for dy in (cy - 1)..=(cy + 1) {
        for dx in (cx - 1)..=(cx + 1) {
            if let Some(cost) = sad(prev, cur, bx, by, dx, dy) {
                if cost < best_cost {
                    best_cost = cost;
                    best = (dx, dy);
                }
            }
        }
    }
    best
}

/// Sum of absolute differences between the block at (bx, by) in `cur` and the
/// block displaced by (dx, dy) in `prev`. None when the displaced block falls
/// outside the raster.
fn sad(prev: &GrayImage, cur: &GrayImage, bx: u32, by: u32, dx: i32, dy: i32) -> Option<u32> {
    let px = bx as i32 + dx;
    let py = by as i32 + dy;
    if px < 0
        || py < 0
        || (px + BLOCK as i32) > ANALYSIS_SIZE as i32
        || (py + BLOCK as i32) > ANALYSIS_SIZE as i32
    {
        return None;
    }
    let (px, py) = (px as u32, py as u32);
    let mut cost = 0u32;
    for y in 0..BLOCK {
        for x in 0..BLOCK {
            let a = cur.get_pixel(bx + x, by + y).0[0] as i32;
            let b = prev.get_pixel(px + x, py + y).0[0] as i32;
            cost += (a - b).unsigned_abs();
        }
    }
    Some(cost)
}

#[cfg(test)]
fn textured_frame(shift_x: u32) -> RgbImage {
    // Deterministic aperiodic texture; periodic patterns would let the block
    // search lock onto a repeat instead of the true displacement.
    image::RgbImage::from_fn(320, 320, |x, y| {
        let sx = x.wrapping_sub(shift_x) / 2;
        let sy = y / 2;
        let h = sx.wrapping_mul(2654435761).wrapping_add(sy.wrapping_mul(40503));
        let v = ((h >> 7) % 256) as u8;
        image::Rgb([v, v, v])
    })
}

#[test]
fn test_static_scene_has_no_motion() {
    let mut est = MotionEstimator::new();
    assert_eq!(est.update(&textured_frame(0)), 0.0);
    let magnitude = est.update(&textured_frame(0));
    assert!(magnitude < 0.5, "static magnitude was {magnitude}");
}

#[test]
fn test_translation_is_detected() {
    let mut est = MotionEstimator::new();
    est.update(&textured_frame(0));
    // 8 source pixels shift → 4 analysis pixels after the 2× downscale.
    let magnitude = est.update(&textured_frame(8));
    assert!(
        magnitude > 2.5,
        "translated magnitude was {magnitude}, expected above the motion threshold"
    );
}
