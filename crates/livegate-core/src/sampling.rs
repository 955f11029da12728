//! Frame sampling and detection caching.
//!
//! Detection and verification are the two expensive steps of a tick, so each
//! runs only every N frames, with N picked from the measured frame rate: a
//! fast loop samples less often to protect its rate, a slow loop samples more
//! often to stay responsive. Between detections the last result is reused
//! from [`DetectionCache`] until it goes stale.

use image::imageops::FilterType;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{SamplingConfig, SamplingTier};
use crate::store::{LruStateStore, StateStore};
use crate::types::{DetectedFace, SubjectId};

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Frames-per-second over rolling one-second windows.
#[derive(Debug, Clone, Default)]
pub struct FpsMeter {
    frames: u32,
    window_start: Option<Instant>,
    fps: f32,
}

impl FpsMeter {
    /// Count one frame; returns the most recent full-window rate.
    pub fn tick(&mut self, now: Instant) -> f32 {
        self.frames += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= FPS_WINDOW {
            self.fps = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = Some(now);
        }
        self.fps
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }
}

/// Picks detection/verification frequencies from the measured frame rate.
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    tiers: Vec<SamplingTier>,
}

impl SamplingPolicy {
    /// `tiers` must be ordered fastest first and non-empty.
    pub fn new(tiers: Vec<SamplingTier>) -> Self {
        Self { tiers }
    }

    pub fn tier(&self, fps: f32) -> SamplingTier {
        self.tiers
            .iter()
            .find(|t| fps > t.above_fps)
            .or_else(|| self.tiers.last())
            .copied()
            .unwrap_or(SamplingTier {
                above_fps: 0.0,
                detect_every: 1,
                verify_every: 1,
            })
    }
}

/// Independent frame counters for detection and verification.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    policy: SamplingPolicy,
    detect_counter: u64,
    verify_counter: u64,
}

impl FrameSampler {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            policy,
            detect_counter: 0,
            verify_counter: 0,
        }
    }

    pub fn should_detect(&mut self, fps: f32) -> bool {
        self.detect_counter += 1;
        let every = u64::from(self.policy.tier(fps).detect_every.max(1));
        self.detect_counter % every == 0
    }

    pub fn should_verify(&mut self, fps: f32) -> bool {
        self.verify_counter += 1;
        let every = u64::from(self.policy.tier(fps).verify_every.max(1));
        self.verify_counter % every == 0
    }
}

/// Immutable view of the cache handed to consumers each tick.
#[derive(Debug, Clone)]
pub struct DetectionSnapshot {
    pub faces: Arc<[DetectedFace]>,
    pub captured_at: Instant,
    /// Confidence in `[0, 1]` after age decay.
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct CachedDetection {
    faces: Arc<[DetectedFace]>,
    captured_at: Instant,
    initial_confidence: f32,
}

/// Last valid detection result with linear confidence decay.
#[derive(Debug, Clone)]
pub struct DetectionCache {
    entry: Option<CachedDetection>,
    ttl: Duration,
    decay_per_sec: f32,
}

impl DetectionCache {
    pub fn new(ttl: Duration, decay_per_sec: f32) -> Self {
        Self {
            entry: None,
            ttl,
            decay_per_sec,
        }
    }

    /// Replace the cached result. More faces in one shot raise the initial
    /// confidence, capped at 1.
    pub fn store(&mut self, faces: Vec<DetectedFace>, now: Instant) {
        let initial_confidence = (0.8 + 0.1 * faces.len() as f32).min(1.0);
        self.entry = Some(CachedDetection {
            faces: faces.into(),
            captured_at: now,
            initial_confidence,
        });
    }

    /// Snapshot of the cached result, or `None` once it is older than the
    /// TTL (which also invalidates it).
    pub fn snapshot(&mut self, now: Instant) -> Option<DetectionSnapshot> {
        let entry = self.entry.as_ref()?;
        let age = now.saturating_duration_since(entry.captured_at);
        if age >= self.ttl {
            tracing::trace!(age_ms = age.as_millis() as u64, "detection cache expired");
            self.entry = None;
            return None;
        }
        let confidence =
            (entry.initial_confidence - self.decay_per_sec * age.as_secs_f32()).max(0.0);
        Some(DetectionSnapshot {
            faces: Arc::clone(&entry.faces),
            captured_at: entry.captured_at,
            confidence,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.entry.is_some()
    }
}

/// A frame shrunk for detection, with the factors that map boxes back.
pub struct Downscaled {
    pub image: RgbImage,
    pub scale_x: f32,
    pub scale_y: f32,
}

pub fn downscale_for_detection(frame: &RgbImage, width: u32, height: u32) -> Downscaled {
    let (width, height) = (width.max(1), height.max(1));
    let image = image::imageops::resize(frame, width, height, FilterType::Triangle);
    Downscaled {
        image,
        scale_x: frame.width() as f32 / width as f32,
        scale_y: frame.height() as f32 / height as f32,
    }
}

/// Rolling window of per-frame "face present" flags.
#[derive(Debug, Clone)]
pub struct StabilityBuffer {
    window: VecDeque<bool>,
    capacity: usize,
    threshold: usize,
}

impl StabilityBuffer {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            threshold,
        }
    }

    /// Record this frame and return whether faces are stably present.
    pub fn push(&mut self, present: bool) -> bool {
        self.window.push_back(present);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        self.window.iter().filter(|&&p| p).count() >= self.threshold
    }
}

/// Debounces the "No face detected" message.
#[derive(Debug, Clone)]
pub struct NoFaceNotice {
    delay: Duration,
    unstable_since: Option<Instant>,
}

impl NoFaceNotice {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            unstable_since: None,
        }
    }

    /// Returns whether the message should be shown this frame.
    pub fn update(&mut self, stable: bool, now: Instant) -> bool {
        if stable {
            self.unstable_since = None;
            return false;
        }
        let since = *self.unstable_since.get_or_insert(now);
        now.saturating_duration_since(since) >= self.delay
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LastEvaluated(Option<Instant>);

/// Per-subject pacing of liveness evaluations between sampled frames.
pub struct VerifyThrottle {
    min_interval: Duration,
    last: LruStateStore<LastEvaluated>,
}

impl VerifyThrottle {
    pub fn new(min_interval: Duration, max_subjects: usize) -> Self {
        Self {
            min_interval,
            last: LruStateStore::new(max_subjects),
        }
    }

    /// Due when this frame is a sampled verify frame, or the subject has not
    /// been evaluated for longer than the minimum interval. Marks it evaluated.
    pub fn due(&mut self, subject: &SubjectId, sampled: bool, now: Instant) -> bool {
        let last = self.last.get_or_create(subject);
        let stale = last
            .0
            .map_or(true, |at| now.saturating_duration_since(at) > self.min_interval);
        if sampled || stale {
            last.0 = Some(now);
            return true;
        }
        false
    }
}

/// Everything the sampling layer needs, built from configuration.
pub(crate) struct SamplingLayer {
    pub fps: FpsMeter,
    pub sampler: FrameSampler,
    pub cache: DetectionCache,
    pub stability: StabilityBuffer,
    pub no_face: NoFaceNotice,
    pub throttle: VerifyThrottle,
}

impl SamplingLayer {
    pub fn new(config: &SamplingConfig, max_subjects: usize) -> Self {
        Self {
            fps: FpsMeter::default(),
            sampler: FrameSampler::new(SamplingPolicy::new(config.tiers.clone())),
            cache: DetectionCache::new(config.cache_ttl(), config.confidence_decay_per_sec),
            stability: StabilityBuffer::new(
                config.stability_window,
                config.stability_threshold,
            ),
            no_face: NoFaceNotice::new(config.no_face_delay()),
            throttle: VerifyThrottle::new(config.verify_min_interval(), max_subjects),
        }
    }
}
