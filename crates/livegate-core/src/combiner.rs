use crate::config::CombinerConfig;

/// Result of folding one frame into a subject's running counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedFrame {
    pub score: f32,
    /// Counter value after this frame.
    pub real_frames: u32,
    pub verified: bool,
}

/// Fuses the spoof score and the movement verdict into one liveness score and
/// applies leaky-bucket hysteresis across frames.
///
/// The counter increments on a passing frame and leaks `decay_step` (floored
/// at zero) on a failing one, so a single noisy frame does not throw away
/// accumulated evidence.
#[derive(Debug, Clone, Default)]
pub struct ScoreCombiner {
    config: CombinerConfig,
}

impl ScoreCombiner {
    pub fn new(config: CombinerConfig) -> Self {
        Self { config }
    }

    /// Movement is binary: it contributes either nothing or its full weight.
    pub fn combine(&self, spoof: f32, movement: bool) -> f32 {
        let movement = if movement { 1.0 } else { 0.0 };
        spoof * self.config.spoof_weight + movement * self.config.movement_weight
    }

    /// Update `real_frames` with this frame and decide verification.
    ///
    /// Verification requires the counter to reach `required_frames` *and* the
    /// current frame's movement to be satisfied; an earlier satisfied flag
    /// alone cannot verify.
    pub fn apply(&self, real_frames: &mut u32, spoof: f32, movement: bool) -> CombinedFrame {
        let score = self.combine(spoof, movement);
        if score >= self.config.threshold {
            *real_frames = real_frames.saturating_add(1);
        } else {
            *real_frames = real_frames.saturating_sub(self.config.decay_step);
        }
        CombinedFrame {
            score,
            real_frames: *real_frames,
            verified: *real_frames >= self.config.required_frames && movement,
        }
    }

    /// Fraction of the required real frames accumulated, clamped to `1.0`.
    pub fn progress(&self, real_frames: u32) -> f32 {
        let required = self.config.required_frames.max(1);
        (real_frames as f32 / required as f32).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_adds_full_weight() {
        let c = ScoreCombiner::default();
        assert!((c.combine(0.5, false) - 0.3).abs() < 1e-6);
        assert!((c.combine(0.5, true) - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_counter_leaks_and_floors_at_zero() {
        let c = ScoreCombiner::default();
        let mut n = 0;
        c.apply(&mut n, 0.9, false);
        c.apply(&mut n, 0.9, false);
        assert_eq!(n, 2);
        c.apply(&mut n, 0.0, false);
        assert_eq!(n, 1);
        c.apply(&mut n, 0.0, false);
        c.apply(&mut n, 0.0, false);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_verifies_on_eighth_passing_frame_with_movement() {
        let c = ScoreCombiner::default();
        let mut n = 0;
        for frame in 1..=8 {
            let out = c.apply(&mut n, 0.9, true);
            assert_eq!(out.verified, frame == 8, "frame {frame}");
        }
    }

    #[test]
    fn test_no_verification_without_current_movement() {
        let c = ScoreCombiner::default();
        let mut n = 0;
        for _ in 0..7 {
            c.apply(&mut n, 0.9, true);
        }
        // 0.9 * 0.6 = 0.54 still passes the threshold
        let out = c.apply(&mut n, 0.9, false);
        assert_eq!(out.real_frames, 8);
        assert!(!out.verified);
    }

    #[test]
    fn test_progress_is_clamped() {
        let c = ScoreCombiner::default();
        assert_eq!(c.progress(4), 0.5);
        assert_eq!(c.progress(20), 1.0);
    }

    #[test]
    fn test_custom_decay_step() {
        let c = ScoreCombiner::new(CombinerConfig {
            decay_step: 3,
            ..CombinerConfig::default()
        });
        let mut n = 5;
        c.apply(&mut n, 0.0, false);
        assert_eq!(n, 2);
    }
}
