//! Adaptive frame sampling.
//!
//! Baseline: forward every Nth frame (N = capture_fps / target_fps).
//! Backpressure on the frame bus raises the interval; scene motion lowers it
//! back toward every-frame; a quiet scene snaps back to the baseline. This
//! keeps the GPU fed during bursts and idle during closed hours.

use image::RgbImage;

use crate::motion::MotionEstimator;

/// Bus occupancy (percent of MAXLEN) above which the skip rate increases.
pub const HIGH_WATER_MARK_PCT: f32 = 80.0;
/// Mean flow magnitude above which the scene counts as high-motion.
pub const MOTION_THRESHOLD: f32 = 2.5;

pub struct AdaptiveFrameSampler {
    base_interval: u32,
    current_interval: u32,
    frame_count: u64,
    motion: MotionEstimator,
}

impl AdaptiveFrameSampler {
    pub fn new(capture_fps: u32, target_fps: u32) -> Self {
        let base_interval = (capture_fps / target_fps.max(1)).max(1);
        AdaptiveFrameSampler {
            base_interval,
            current_interval: base_interval,
            frame_count: 0,
            motion: MotionEstimator::new(),
        }
    }

    /// Decide whether this frame is forwarded to the frame bus.
    ///
    /// `fill_pct` is the bus occupancy for this camera as a percentage of
    /// MAXLEN. Under backpressure the motion estimate is skipped entirely;
    /// its previous-frame state then simply resumes once pressure clears.
    pub fn should_forward(&mut self, frame: &RgbImage, fill_pct: f32) -> bool {
        self.frame_count += 1;

        if fill_pct > HIGH_WATER_MARK_PCT {
            self.current_interval = (self.current_interval + 1).min(self.base_interval * 3);
        } else {
            let magnitude = self.motion.update(frame);
            if magnitude > MOTION_THRESHOLD {
                self.current_interval = self.current_interval.saturating_sub(1).max(1);
            } else {
                self.current_interval = self.base_interval;
            }
        }

        self.frame_count % self.current_interval as u64 == 0
    }

    pub fn current_interval(&self) -> u32 {
        self.current_interval
    }

    pub fn base_interval(&self) -> u32 {
        self.base_interval
    }
}

#[cfg(test)]
fn blank() -> RgbImage {
    RgbImage::from_pixel(32, 32, image::Rgb([127, 127, 127]))
}

#[test]
fn test_base_interval_from_fps() {
    assert_eq!(AdaptiveFrameSampler::new(30, 15).base_interval(), 2);
    assert_eq!(AdaptiveFrameSampler::new(30, 10).base_interval(), 3);
    // target above capture clamps to every frame
    assert_eq!(AdaptiveFrameSampler::new(15, 30).base_interval(), 1);
}

#[test]
fn test_forwards_every_nth_frame_when_quiet() {
    let mut sampler = AdaptiveFrameSampler::new(30, 15);
    let decisions: Vec<bool> = (0..6).map(|_| sampler.should_forward(&blank(), 0.0)).collect();
    assert_eq!(decisions, vec![false, true, false, true, false, true]);
}

#[test]
fn test_backpressure_raises_interval_and_caps() {
    let mut sampler = AdaptiveFrameSampler::new(30, 15);
    for _ in 0..20 {
        sampler.should_forward(&blank(), 95.0);
    }
    // Capped at 3 × base_interval.
    assert_eq!(sampler.current_interval(), 6);
}

#[test]
fn test_fill_exactly_at_high_water_mark_is_not_backpressure() {
    let mut sampler = AdaptiveFrameSampler::new(30, 15);
    sampler.should_forward(&blank(), HIGH_WATER_MARK_PCT);
    // The quiet-scene branch ran: interval stays at baseline.
    assert_eq!(sampler.current_interval(), sampler.base_interval());
}

#[test]
fn test_interval_recovers_to_base_when_pressure_clears() {
    let mut sampler = AdaptiveFrameSampler::new(30, 15);
    for _ in 0..4 {
        sampler.should_forward(&blank(), 95.0);
    }
    assert!(sampler.current_interval() > sampler.base_interval());
    sampler.should_forward(&blank(), 10.0);
    assert_eq!(sampler.current_interval(), sampler.base_interval());
}
