//! Tunables for the liveness engine.
//!
//! The constants below were tuned empirically against a laptop webcam at
//! 640×480; they are configuration, not invariants. Every section carries
//! `#[serde(default)]` so a TOML file only needs the keys it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// When false, known subjects may blink-confirm without a challenge.
    pub require_liveness: bool,
    /// Capacity of every per-subject state store (enrolled-subject count).
    pub max_subjects: usize,
    pub challenge: ChallengeConfig,
    pub combiner: CombinerConfig,
    pub spoof: SpoofConfig,
    pub sampling: SamplingConfig,
    pub blink: BlinkConfig,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            require_liveness: true,
            max_subjects: 256,
            challenge: ChallengeConfig::default(),
            combiner: CombinerConfig::default(),
            spoof: SpoofConfig::default(),
            sampling: SamplingConfig::default(),
            blink: BlinkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Seconds a subject has to complete an assigned challenge.
    pub timeout_secs: f64,
    /// Seconds a successful verification stays valid.
    pub verified_ttl_secs: f64,
    /// Seconds after a verification during which no new challenge is issued.
    pub rearm_cooldown_secs: f64,
    /// Centroid displacement in pixels for turn and nod challenges.
    pub motion_threshold: i32,
    /// Box-area growth factor for the move-closer challenge.
    pub closer_ratio: f64,
    /// Number of most recent samples inspected for a nod.
    pub nod_window: usize,
    pub history_len: usize,
    /// Samples required before any movement judgement.
    pub min_history: usize,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5.0,
            verified_ttl_secs: 60.0,
            rearm_cooldown_secs: 30.0,
            motion_threshold: 12,
            closer_ratio: 1.10,
            nod_window: 5,
            history_len: 10,
            min_history: 3,
        }
    }
}

impl ChallengeConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn verified_ttl(&self) -> Duration {
        secs(self.verified_ttl_secs)
    }

    pub fn rearm_cooldown(&self) -> Duration {
        secs(self.rearm_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinerConfig {
    pub spoof_weight: f32,
    pub movement_weight: f32,
    /// Minimum combined score for a frame to count as "real".
    pub threshold: f32,
    /// Real-frame count needed before verification may fire.
    pub required_frames: u32,
    /// Amount the counter leaks on a failing frame.
    pub decay_step: u32,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            spoof_weight: 0.6,
            movement_weight: 0.4,
            threshold: 0.4,
            required_frames: 8,
            decay_step: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofConfig {
    /// Fold the screen-artifact detector into the per-frame score.
    pub strict: bool,
    /// Laplacian variance that maps to a full texture score.
    pub texture_divisor: f64,
    /// Multiplier applied to edge density before inversion.
    pub edge_density_gain: f32,
    pub canny_low: f32,
    pub canny_high: f32,
}

impl Default for SpoofConfig {
    fn default() -> Self {
        Self {
            strict: false,
            texture_divisor: 200.0,
            edge_density_gain: 8.0,
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

/// Sampling frequencies used while the measured frame rate is above `above_fps`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingTier {
    pub above_fps: f32,
    /// Run face detection every N frames.
    pub detect_every: u32,
    /// Run liveness verification every N stable frames.
    pub verify_every: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Ordered fastest first; the last tier applies to any lower rate.
    pub tiers: Vec<SamplingTier>,
    /// Age beyond which a cached detection is discarded.
    pub cache_ttl_secs: f64,
    /// Confidence lost per second of cache age.
    pub confidence_decay_per_sec: f32,
    pub detection_width: u32,
    pub detection_height: u32,
    pub stability_window: usize,
    pub stability_threshold: usize,
    /// Continuous instability before "No face detected" is shown.
    pub no_face_delay_secs: f64,
    /// Re-evaluate a subject at least this often even between sampled frames.
    pub verify_min_interval_secs: f64,
    /// Pixels added around a face box before spoof scoring.
    pub face_margin: i32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            cache_ttl_secs: 1.2,
            confidence_decay_per_sec: 0.2,
            detection_width: 320,
            detection_height: 240,
            stability_window: 2,
            stability_threshold: 1,
            no_face_delay_secs: 2.0,
            verify_min_interval_secs: 0.5,
            face_margin: 10,
        }
    }
}

impl SamplingConfig {
    pub fn cache_ttl(&self) -> Duration {
        secs(self.cache_ttl_secs)
    }

    pub fn no_face_delay(&self) -> Duration {
        secs(self.no_face_delay_secs)
    }

    pub fn verify_min_interval(&self) -> Duration {
        secs(self.verify_min_interval_secs)
    }
}

fn default_tiers() -> Vec<SamplingTier> {
    vec![
        SamplingTier {
            above_fps: 30.0,
            detect_every: 6,
            verify_every: 4,
        },
        SamplingTier {
            above_fps: 20.0,
            detect_every: 5,
            verify_every: 3,
        },
        SamplingTier {
            above_fps: 0.0,
            detect_every: 4,
            verify_every: 2,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    /// Eye aspect ratio used when calibration is disabled or finds no face.
    pub default_ear: f32,
    pub dynamic_calibration: bool,
    pub calibration_frames: usize,
    /// Closed-eye threshold as a fraction of the calibrated baseline.
    pub threshold_ratio: f32,
    pub min_blink_frames: u32,
    /// Minimum seconds between two confirmations of the same subject.
    pub display_time_secs: f64,
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            default_ear: 0.25,
            dynamic_calibration: true,
            calibration_frames: 20,
            threshold_ratio: 0.8,
            min_blink_frames: 2,
            display_time_secs: 10.0,
        }
    }
}

impl BlinkConfig {
    pub fn display_time(&self) -> Duration {
        secs(self.display_time_secs)
    }
}

impl LivenessConfig {
    /// Clamp values that would break the engine, warning about each change.
    pub fn validated(mut self) -> Self {
        if self.sampling.tiers.is_empty() {
            tracing::warn!("no sampling tiers configured; using defaults");
            self.sampling.tiers = default_tiers();
        }
        for tier in &mut self.sampling.tiers {
            if tier.detect_every == 0 || tier.verify_every == 0 {
                tracing::warn!(above_fps = tier.above_fps, "sampling frequency below 1; clamping");
                tier.detect_every = tier.detect_every.max(1);
                tier.verify_every = tier.verify_every.max(1);
            }
        }
        self.sampling
            .tiers
            .sort_by(|a, b| b.above_fps.total_cmp(&a.above_fps));

        if self.sampling.stability_window == 0 {
            tracing::warn!("stability window of 0; using 1");
            self.sampling.stability_window = 1;
        }
        if self.sampling.stability_threshold > self.sampling.stability_window {
            tracing::warn!(
                threshold = self.sampling.stability_threshold,
                window = self.sampling.stability_window,
                "stability threshold exceeds window; clamping"
            );
            self.sampling.stability_threshold = self.sampling.stability_window;
        }

        if !(0.1..=0.5).contains(&self.blink.default_ear) {
            tracing::warn!(
                default_ear = self.blink.default_ear,
                "default eye aspect ratio out of range; using 0.25"
            );
            self.blink.default_ear = 0.25;
        }

        if self.combiner.required_frames == 0 {
            tracing::warn!("required_frames of 0; using 1");
            self.combiner.required_frames = 1;
        }
        if self.max_subjects == 0 {
            tracing::warn!("max_subjects of 0; using 1");
            self.max_subjects = 1;
        }
        self
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
