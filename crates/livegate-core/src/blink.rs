//! Blink-gated confirmation.
//!
//! Once a subject passes the liveness challenge, a deliberate blink fires a
//! single confirmation event. Eye closure is measured with the eye aspect
//! ratio (EAR) over the 68-point landmark layout, against a per-session
//! baseline calibrated from the subject population in front of the camera.

use std::time::{Duration, Instant};

use crate::config::BlinkConfig;
use crate::error::DetectError;
use crate::store::{LruStateStore, StateStore};
use crate::types::{Point, SubjectId};

const LANDMARK_COUNT: usize = 68;
const RIGHT_EYE: std::ops::Range<usize> = 36..42;
const LEFT_EYE: std::ops::Range<usize> = 42..48;

/// A 68-point facial landmark set in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmarks {
    points: Vec<Point>,
}

impl Landmarks {
    pub fn new(points: Vec<Point>) -> Result<Self, DetectError> {
        if points.len() != LANDMARK_COUNT {
            return Err(DetectError::LandmarkCount(points.len()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn left_eye(&self) -> &[Point] {
        &self.points[LEFT_EYE]
    }

    pub fn right_eye(&self) -> &[Point] {
        &self.points[RIGHT_EYE]
    }

    /// Mean of both eyes' aspect ratios.
    pub fn mean_ear(&self) -> f32 {
        (eye_aspect_ratio(self.left_eye()) + eye_aspect_ratio(self.right_eye())) / 2.0
    }
}

/// Eye aspect ratio of a six-point eye contour.
///
/// `(|p1−p5| + |p2−p4|) / (2·|p0−p3|)`: the two vertical spans over the
/// horizontal one. Returns `0.0` for a malformed contour or a collapsed
/// horizontal span.
pub fn eye_aspect_ratio(eye: &[Point]) -> f32 {
    if eye.len() != 6 {
        return 0.0;
    }
    let vertical = eye[1].distance(&eye[5]) + eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);
    if horizontal <= f32::EPSILON {
        return 0.0;
    }
    vertical / (2.0 * horizontal)
}

/// Averages the EAR of the first calibration frames that contain a face.
#[derive(Debug, Clone)]
pub struct EarCalibrator {
    target_frames: usize,
    frames_seen: usize,
    total: f32,
    valid: usize,
    fallback: f32,
}

impl EarCalibrator {
    pub fn new(config: &BlinkConfig) -> Self {
        Self {
            target_frames: config.calibration_frames,
            frames_seen: 0,
            total: 0.0,
            valid: 0,
            fallback: config.default_ear,
        }
    }

    /// Feed one frame's mean EAR, or `None` when no face was found.
    pub fn observe(&mut self, ear: Option<f32>) {
        if self.is_complete() {
            return;
        }
        self.frames_seen += 1;
        if let Some(ear) = ear {
            self.total += ear;
            self.valid += 1;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.frames_seen >= self.target_frames
    }

    /// Calibrated baseline, or the configured default if no face was seen.
    pub fn baseline(&self) -> f32 {
        if self.valid == 0 {
            return self.fallback;
        }
        self.total / self.valid as f32
    }
}

/// Source of truth for whether a subject may confirm.
pub trait VerificationSource {
    fn is_verified(&mut self, subject: &SubjectId, now: Instant) -> bool;
    /// Consume the verification after a confirmation.
    fn reset(&mut self, subject: &SubjectId);
}

/// Verification source for deployments that run without liveness challenges.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysVerified;

impl VerificationSource for AlwaysVerified {
    fn is_verified(&mut self, _subject: &SubjectId, _now: Instant) -> bool {
        true
    }

    fn reset(&mut self, _subject: &SubjectId) {}
}

#[derive(Debug, Clone, Default)]
pub struct BlinkState {
    pub closed_frames: u32,
    pub last_confirmation_at: Option<Instant>,
    pub can_confirm: bool,
}

/// Emitted when a verified subject completes a blink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub subject: SubjectId,
    pub at: Instant,
}

pub struct BlinkGate {
    threshold: f32,
    min_blink_frames: u32,
    display_time: Duration,
    states: LruStateStore<BlinkState>,
}

impl BlinkGate {
    pub fn new(config: &BlinkConfig, baseline_ear: f32, max_subjects: usize) -> Self {
        let threshold = baseline_ear * config.threshold_ratio;
        tracing::info!(baseline_ear, threshold, "blink gate armed");
        Self {
            threshold,
            min_blink_frames: config.min_blink_frames,
            display_time: config.display_time(),
            states: LruStateStore::new(max_subjects),
        }
    }

    /// True while a blink from `subject` would be accepted: the gate was
    /// open at the last observation and `verifier` still holds the subject
    /// verified at `now`.
    pub fn can_confirm<V: VerificationSource + ?Sized>(
        &self,
        verifier: &mut V,
        subject: &SubjectId,
        now: Instant,
    ) -> bool {
        self.states.get(subject).is_some_and(|s| s.can_confirm)
            && verifier.is_verified(subject, now)
    }

    /// Mark the subject unconfirmable and drop any closed-eye run in progress.
    pub fn close(&mut self, subject: &SubjectId) {
        if let Some(state) = self.states.get_mut(subject) {
            state.can_confirm = false;
            state.closed_frames = 0;
        }
    }

    /// Feed one frame's mean EAR for `subject`.
    ///
    /// A confirmation fires when the eyes reopen after at least
    /// `min_blink_frames` closed frames, the subject is verified, and the
    /// previous confirmation is older than the display time. Firing consumes
    /// the verification through `verifier.reset`.
    pub fn observe<V: VerificationSource + ?Sized>(
        &mut self,
        verifier: &mut V,
        subject: &SubjectId,
        ear: f32,
        now: Instant,
    ) -> Option<Confirmation> {
        let verified = verifier.is_verified(subject, now);
        let state = self.states.get_or_create(subject);
        state.can_confirm = verified;
        if !verified {
            state.closed_frames = 0;
            return None;
        }

        if ear < self.threshold {
            state.closed_frames += 1;
            return None;
        }

        let closed = std::mem::take(&mut state.closed_frames);
        if closed < self.min_blink_frames {
            return None;
        }

        let rested = state
            .last_confirmation_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.display_time);
        if !rested {
            tracing::debug!(subject = %subject, "blink ignored: confirmed too recently");
            return None;
        }

        state.last_confirmation_at = Some(now);
        state.can_confirm = false;
        verifier.reset(subject);
        tracing::info!(subject = %subject, closed_frames = closed, "blink confirmed");
        Some(Confirmation {
            subject: subject.clone(),
            at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct StubVerifier {
        verified: HashSet<SubjectId>,
        resets: usize,
    }

    impl VerificationSource for StubVerifier {
        fn is_verified(&mut self, subject: &SubjectId, _now: Instant) -> bool {
            self.verified.contains(subject)
        }

        fn reset(&mut self, subject: &SubjectId) {
            self.verified.remove(subject);
            self.resets += 1;
        }
    }

    fn verifier_for(subject: &SubjectId) -> StubVerifier {
        let mut v = StubVerifier::default();
        v.verified.insert(subject.clone());
        v
    }

    /// Six-point eye centred on (cx, cy) whose EAR is `openness / 5`.
    fn eye(cx: f32, cy: f32, openness: f32) -> [Point; 6] {
        [
            Point::new(cx - 5.0, cy),
            Point::new(cx - 2.0, cy - openness),
            Point::new(cx + 2.0, cy - openness),
            Point::new(cx + 5.0, cy),
            Point::new(cx + 2.0, cy + openness),
            Point::new(cx - 2.0, cy + openness),
        ]
    }

    fn landmarks(openness: f32) -> Landmarks {
        let mut points = vec![Point::default(); 68];
        points[36..42].copy_from_slice(&eye(100.0, 100.0, openness));
        points[42..48].copy_from_slice(&eye(160.0, 100.0, openness));
        Landmarks::new(points).unwrap()
    }

    fn gate() -> BlinkGate {
        // baseline 0.3 → threshold 0.24
        BlinkGate::new(&BlinkConfig::default(), 0.3, 16)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_ear_of_known_geometry() {
        assert!((eye_aspect_ratio(&eye(0.0, 0.0, 1.5)) - 0.3).abs() < 1e-6);
        assert!((landmarks(0.5).mean_ear() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_eye_is_zero() {
        let flat = [Point::new(5.0, 5.0); 6];
        assert_eq!(eye_aspect_ratio(&flat), 0.0);
        assert_eq!(eye_aspect_ratio(&flat[..4]), 0.0);
    }

    #[test]
    fn test_landmarks_require_68_points() {
        let err = Landmarks::new(vec![Point::default(); 5]).unwrap_err();
        assert!(matches!(err, DetectError::LandmarkCount(5)));
    }

    #[test]
    fn test_two_frame_blink_fires_once() {
        let alice = SubjectId::from("alice");
        let mut v = verifier_for(&alice);
        let mut g = gate();
        let t0 = Instant::now();

        assert!(g.observe(&mut v, &alice, 0.1, t0).is_none());
        assert!(g.observe(&mut v, &alice, 0.1, t0 + ms(33)).is_none());
        assert!(g.can_confirm(&mut v, &alice, t0 + ms(33)));
        let fired = g.observe(&mut v, &alice, 0.3, t0 + ms(66)).unwrap();
        assert_eq!(fired.subject, alice);
        assert_eq!(fired.at, t0 + ms(66));
        assert!(!g.can_confirm(&mut v, &alice, t0 + ms(66)));
        assert_eq!(v.resets, 1);

        // Verification was consumed: a second blink does nothing.
        g.observe(&mut v, &alice, 0.1, t0 + ms(100));
        g.observe(&mut v, &alice, 0.1, t0 + ms(133));
        assert!(g.observe(&mut v, &alice, 0.3, t0 + ms(166)).is_none());
    }

    #[test]
    fn test_single_closed_frame_is_not_a_blink() {
        let alice = SubjectId::from("alice");
        let mut v = verifier_for(&alice);
        let mut g = gate();
        let t0 = Instant::now();
        g.observe(&mut v, &alice, 0.1, t0);
        assert!(g.observe(&mut v, &alice, 0.3, t0 + ms(33)).is_none());
        assert!(g.can_confirm(&mut v, &alice, t0 + ms(33)));
    }

    #[test]
    fn test_unverified_subject_never_confirms() {
        let bob = SubjectId::from("bob");
        let mut v = StubVerifier::default();
        let mut g = gate();
        let t0 = Instant::now();
        for i in 0..3 {
            g.observe(&mut v, &bob, 0.1, t0 + ms(i * 33));
        }
        assert!(g.observe(&mut v, &bob, 0.3, t0 + ms(100)).is_none());
        assert!(!g.can_confirm(&mut v, &bob, t0 + ms(100)));
    }

    #[test]
    fn test_display_time_spaces_confirmations() {
        let alice = SubjectId::from("alice");
        let mut v = verifier_for(&alice);
        let mut g = gate();
        let t0 = Instant::now();
        let blink = |g: &mut BlinkGate, v: &mut StubVerifier, at: Instant| {
            g.observe(v, &alice, 0.1, at);
            g.observe(v, &alice, 0.1, at + ms(33));
            g.observe(v, &alice, 0.3, at + ms(66))
        };

        assert!(blink(&mut g, &mut v, t0).is_some());
        v.verified.insert(alice.clone());
        assert!(blink(&mut g, &mut v, t0 + ms(5_000)).is_none());
        assert!(blink(&mut g, &mut v, t0 + ms(10_000)).is_some());
    }

    #[test]
    fn test_close_drops_closed_run() {
        let alice = SubjectId::from("alice");
        let mut v = verifier_for(&alice);
        let mut g = gate();
        let t0 = Instant::now();
        g.observe(&mut v, &alice, 0.1, t0);
        g.observe(&mut v, &alice, 0.1, t0 + ms(33));
        g.close(&alice);
        assert!(!g.can_confirm(&mut v, &alice, t0 + ms(33)));
        assert!(g.observe(&mut v, &alice, 0.3, t0 + ms(66)).is_none());
    }

    /// Holds one verification for `ttl` after `at`.
    struct ExpiringVerifier {
        at: Instant,
        ttl: Duration,
    }

    impl VerificationSource for ExpiringVerifier {
        fn is_verified(&mut self, _subject: &SubjectId, now: Instant) -> bool {
            now.saturating_duration_since(self.at) < self.ttl
        }

        fn reset(&mut self, _subject: &SubjectId) {}
    }

    #[test]
    fn test_expired_verification_cannot_confirm() {
        let alice = SubjectId::from("alice");
        let t0 = Instant::now();
        let mut v = ExpiringVerifier {
            at: t0,
            ttl: ms(60_000),
        };
        let mut g = gate();
        g.observe(&mut v, &alice, 0.3, t0);
        assert!(g.can_confirm(&mut v, &alice, t0 + ms(1_000)));
        // Off camera since: no observation, but the verification has lapsed.
        assert!(!g.can_confirm(&mut v, &alice, t0 + ms(90_000)));
    }

    #[test]
    fn test_calibration_averages_faces_only() {
        let mut c = EarCalibrator::new(&BlinkConfig {
            calibration_frames: 4,
            ..BlinkConfig::default()
        });
        c.observe(Some(0.30));
        c.observe(None);
        c.observe(Some(0.34));
        assert!(!c.is_complete());
        c.observe(None);
        assert!(c.is_complete());
        c.observe(Some(0.9)); // ignored once complete
        assert!((c.baseline() - 0.32).abs() < 1e-6);
    }

    #[test]
    fn test_calibration_without_face_falls_back() {
        let mut c = EarCalibrator::new(&BlinkConfig::default());
        for _ in 0..20 {
            c.observe(None);
        }
        assert_eq!(c.baseline(), 0.25);
    }
}
