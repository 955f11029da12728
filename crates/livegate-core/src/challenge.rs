//! Per-subject challenge-response state machine.
//!
//! ```text
//! IDLE ──start_challenge──▶ CHALLENGE_ACTIVE ──evaluate──▶ VERIFIED ──60s / reset──▶ IDLE
//!                                 │
//!                                 └──── timeout (5s) ────▶ EXPIRED ──▶ IDLE
//! ```
//!
//! `evaluate` is the only path into `VERIFIED`, and it closes the active
//! challenge in the same step. Expiry of a verification is pull-based: it is
//! noticed the next time [`LivenessEngine::is_verified`] is asked.

use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::blink::VerificationSource;
use crate::combiner::ScoreCombiner;
use crate::config::{ChallengeConfig, LivenessConfig};
use crate::movement::{MovementAnalyzer, MovementTrack};
use crate::spoof::{scorer_from_config, SpoofScorer};
use crate::store::{LruStateStore, StateStore};
use crate::types::{FaceBox, SubjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    TurnLeft,
    TurnRight,
    MoveCloser,
    NodHead,
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 4] = [
        ChallengeKind::TurnLeft,
        ChallengeKind::TurnRight,
        ChallengeKind::MoveCloser,
        ChallengeKind::NodHead,
    ];

    /// Full sentence shown when the challenge is issued.
    pub fn instruction(self) -> &'static str {
        match self {
            ChallengeKind::TurnLeft => "Turn your head LEFT",
            ChallengeKind::TurnRight => "Turn your head RIGHT",
            ChallengeKind::MoveCloser => "Move CLOSER to camera",
            ChallengeKind::NodHead => "NOD your head up/down",
        }
    }

    /// Short label drawn next to the face box.
    pub fn prompt(self) -> &'static str {
        match self {
            ChallengeKind::TurnLeft => "TURN HEAD LEFT",
            ChallengeKind::TurnRight => "TURN HEAD RIGHT",
            ChallengeKind::MoveCloser => "MOVE CLOSER",
            ChallengeKind::NodHead => "NOD HEAD",
        }
    }
}

/// Liveness state for one recognised subject.
#[derive(Debug, Clone, Default)]
pub struct SubjectLivenessState {
    pub active: bool,
    pub challenge_started_at: Option<Instant>,
    pub challenge: Option<ChallengeKind>,
    pub track: MovementTrack,
    pub consecutive_real_frames: u32,
    /// Frames evaluated since the last `start_challenge`.
    pub frames_evaluated: u32,
    pub verified: bool,
    pub last_verified_at: Option<Instant>,
    /// Last movement verdict, reused by cached status queries.
    pub movement_satisfied: bool,
}

impl SubjectLivenessState {
    fn verified_within(&self, window: Duration, now: Instant) -> bool {
        match self.last_verified_at {
            Some(at) if self.verified => now.saturating_duration_since(at) < window,
            _ => false,
        }
    }
}

/// Outcome of evaluating one frame for a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub verified: bool,
    pub status: String,
    pub score: f32,
}

impl Evaluation {
    fn rejected(status: &str) -> Self {
        Self {
            verified: false,
            status: status.to_string(),
            score: 0.0,
        }
    }
}

pub struct LivenessEngine<R = StdRng> {
    config: ChallengeConfig,
    analyzer: MovementAnalyzer,
    combiner: ScoreCombiner,
    scorer: Box<dyn SpoofScorer + Send>,
    rng: R,
    subjects: LruStateStore<SubjectLivenessState>,
}

impl LivenessEngine<StdRng> {
    /// Engine with an entropy-seeded RNG and the configured spoof scorer.
    pub fn new(config: &LivenessConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }
}

impl<R: Rng> LivenessEngine<R> {
    /// Engine drawing challenges from `rng`; pass a seeded RNG for
    /// reproducible challenge sequences.
    pub fn with_rng(config: &LivenessConfig, rng: R) -> Self {
        Self {
            config: config.challenge.clone(),
            analyzer: MovementAnalyzer::new(&config.challenge),
            combiner: ScoreCombiner::new(config.combiner.clone()),
            scorer: scorer_from_config(&config.spoof),
            rng,
            subjects: LruStateStore::new(config.max_subjects),
        }
    }

    /// Replace the spoof scorer.
    pub fn with_scorer(mut self, scorer: Box<dyn SpoofScorer + Send>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Issue a fresh challenge and return its instruction text.
    ///
    /// Returns `None` while a verification younger than the re-arm cooldown
    /// is held, so the display does not flicker between "verified" and a
    /// new challenge.
    pub fn start_challenge(&mut self, subject: &SubjectId, now: Instant) -> Option<&'static str> {
        let cooldown = self.config.rearm_cooldown();
        let kind = ChallengeKind::ALL[self.rng.gen_range(0..ChallengeKind::ALL.len())];

        let state = self.subjects.get_or_create(subject);
        if state.verified_within(cooldown, now) {
            tracing::trace!(subject = %subject, "challenge suppressed: recently verified");
            return None;
        }

        *state = SubjectLivenessState {
            active: true,
            challenge_started_at: Some(now),
            challenge: Some(kind),
            ..SubjectLivenessState::default()
        };

        tracing::info!(subject = %subject, challenge = ?kind, "challenge started");
        Some(kind.instruction())
    }

    /// Score one frame of `subject` against its active challenge.
    ///
    /// `face_box` is in `frame` coordinates; `face_region` is the crop the
    /// spoof scorer inspects.
    pub fn evaluate(
        &mut self,
        subject: &SubjectId,
        frame: &RgbImage,
        face_box: &FaceBox,
        face_region: &RgbImage,
        now: Instant,
    ) -> Evaluation {
        let timeout = self.config.timeout();
        let Some(state) = self.subjects.get_mut(subject) else {
            return Evaluation::rejected("No active challenge");
        };
        let (true, Some(started), Some(challenge)) =
            (state.active, state.challenge_started_at, state.challenge)
        else {
            return Evaluation::rejected("No active challenge");
        };

        if now.saturating_duration_since(started) > timeout {
            state.active = false;
            tracing::info!(subject = %subject, challenge = ?challenge, "challenge timed out");
            return Evaluation::rejected("Challenge timeout - try again");
        }

        tracing::trace!(
            subject = %subject,
            frame_width = frame.width(),
            frame_height = frame.height(),
            region_width = face_region.width(),
            region_height = face_region.height(),
            "evaluating frame"
        );

        let spoof = self.scorer.score(face_region);
        let movement = self.analyzer.observe(&mut state.track, challenge, face_box, now);
        state.movement_satisfied = movement;
        state.frames_evaluated = state.frames_evaluated.saturating_add(1);

        let combined = self
            .combiner
            .apply(&mut state.consecutive_real_frames, spoof, movement);

        tracing::debug!(
            subject = %subject,
            spoof,
            movement,
            score = combined.score,
            real_frames = combined.real_frames,
            "liveness frame scored"
        );

        if combined.verified {
            state.verified = true;
            state.active = false;
            state.last_verified_at = Some(now);
            tracing::info!(subject = %subject, score = combined.score, "liveness verified");
            return Evaluation {
                verified: true,
                status: "Verification successful!".to_string(),
                score: combined.score,
            };
        }

        let progress = self.combiner.progress(combined.real_frames) * 100.0;
        Evaluation {
            verified: false,
            status: format!("{} ({progress:.0}%)", challenge.instruction()),
            score: combined.score,
        }
    }

    /// True while a verification younger than the verified TTL is held.
    ///
    /// An expired verification is cleared here.
    pub fn is_verified(&mut self, subject: &SubjectId, now: Instant) -> bool {
        let ttl = self.config.verified_ttl();
        let Some(state) = self.subjects.get_mut(subject) else {
            return false;
        };
        if state.verified_within(ttl, now) {
            return true;
        }
        if state.verified {
            tracing::debug!(subject = %subject, "verification expired");
            state.verified = false;
        }
        false
    }

    /// Consume the subject's verification; a new challenge is required next.
    pub fn reset(&mut self, subject: &SubjectId) {
        if let Some(state) = self.subjects.get_mut(subject) {
            state.verified = false;
            state.active = false;
        }
    }

    /// Human-readable status for on-screen rendering.
    pub fn status_text(&self, subject: &SubjectId, now: Instant) -> String {
        let Some(state) = self.subjects.get(subject) else {
            return "Ready for verification".to_string();
        };
        if state.verified {
            return "Verified - You can blink now".to_string();
        }
        match (state.active, state.challenge, state.challenge_started_at) {
            (true, Some(kind), Some(started)) => {
                let elapsed = now.saturating_duration_since(started);
                let remaining = self.config.timeout().saturating_sub(elapsed);
                let progress = self.combiner.progress(state.consecutive_real_frames) * 100.0;
                format!(
                    "{} ({progress:.0}% - {:.1}s)",
                    kind.instruction(),
                    remaining.as_secs_f32()
                )
            }
            _ => "Starting verification...".to_string(),
        }
    }

    pub fn is_active(&self, subject: &SubjectId) -> bool {
        self.subjects.get(subject).is_some_and(|s| s.active)
    }

    /// The subject's most recently assigned challenge.
    pub fn challenge(&self, subject: &SubjectId) -> Option<ChallengeKind> {
        self.subjects.get(subject).and_then(|s| s.challenge)
    }

    /// Real-frame progress toward verification in `[0, 1]`.
    pub fn progress(&self, subject: &SubjectId) -> f32 {
        self.subjects
            .get(subject)
            .map(|s| self.combiner.progress(s.consecutive_real_frames))
            .unwrap_or(0.0)
    }

    pub fn subject_state(&self, subject: &SubjectId) -> Option<&SubjectLivenessState> {
        self.subjects.get(subject)
    }
}

impl<R: Rng> VerificationSource for LivenessEngine<R> {
    fn is_verified(&mut self, subject: &SubjectId, now: Instant) -> bool {
        LivenessEngine::is_verified(self, subject, now)
    }

    fn reset(&mut self, subject: &SubjectId) {
        LivenessEngine::reset(self, subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScore(f32);

    impl SpoofScorer for FixedScore {
        fn score(&self, _region: &RgbImage) -> f32 {
            self.0
        }
    }

    fn engine(score: f32) -> LivenessEngine {
        LivenessEngine::with_rng(&LivenessConfig::default(), StdRng::seed_from_u64(42))
            .with_scorer(Box::new(FixedScore(score)))
    }

    fn force_challenge(engine: &mut LivenessEngine, subject: &SubjectId, kind: ChallengeKind) {
        engine.subjects.get_mut(subject).unwrap().challenge = Some(kind);
    }

    fn box_at(x: i32, y: i32) -> FaceBox {
        FaceBox::new(y - 50, x + 50, y + 50, x - 50)
    }

    /// A box that satisfies `kind` once the baseline (frame 0) is in place.
    fn satisfying_box(kind: ChallengeKind, frame: u32) -> FaceBox {
        if frame == 0 {
            return box_at(300, 240);
        }
        match kind {
            ChallengeKind::TurnLeft => box_at(280, 240),
            ChallengeKind::TurnRight => box_at(320, 240),
            ChallengeKind::MoveCloser => FaceBox::new(180, 360, 300, 240),
            ChallengeKind::NodHead => box_at(300, 240 + 15 * (frame % 2) as i32),
        }
    }

    fn region() -> RgbImage {
        RgbImage::new(64, 64)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_start_challenge_activates() {
        let mut e = engine(0.9);
        let alice = SubjectId::from("alice");
        let now = Instant::now();
        let text = e.start_challenge(&alice, now).unwrap();
        let kind = e.challenge(&alice).unwrap();
        assert_eq!(text, kind.instruction());
        assert!(e.is_active(&alice));
        assert!(!e.is_verified(&alice, now));
    }

    #[test]
    fn test_evaluate_without_challenge() {
        let mut e = engine(0.9);
        let out = e.evaluate(
            &"bob".into(),
            &region(),
            &box_at(300, 240),
            &region(),
            Instant::now(),
        );
        assert!(!out.verified);
        assert_eq!(out.status, "No active challenge");
        assert_eq!(out.score, 0.0);
    }

    #[test]
    fn test_timeout_deactivates() {
        let mut e = engine(0.9);
        let alice = SubjectId::from("alice");
        let t0 = Instant::now();
        e.start_challenge(&alice, t0);
        let out = e.evaluate(&alice, &region(), &box_at(300, 240), &region(), t0 + ms(5_001));
        assert_eq!(out.status, "Challenge timeout - try again");
        assert!(!e.is_active(&alice));
        // Caller retries explicitly.
        assert!(e.start_challenge(&alice, t0 + ms(5_002)).is_some());
    }

    #[test]
    fn test_verifies_on_eighth_frame_for_every_challenge() {
        for kind in ChallengeKind::ALL {
            let mut e = engine(0.9);
            let alice = SubjectId::from("alice");
            let t0 = Instant::now();
            e.start_challenge(&alice, t0);
            force_challenge(&mut e, &alice, kind);

            for frame in 0..8u32 {
                let now = t0 + ms(100 * u64::from(frame));
                let out = e.evaluate(&alice, &region(), &satisfying_box(kind, frame), &region(), now);
                assert_eq!(out.verified, frame == 7, "{kind:?} frame {frame}");
                if out.verified {
                    assert_eq!(out.status, "Verification successful!");
                }
            }
            let state = e.subject_state(&alice).unwrap();
            assert!(state.verified && !state.active);
            assert!(e.is_verified(&alice, t0 + ms(800)));
        }
    }

    #[test]
    fn test_no_verification_when_eighth_frame_has_no_movement() {
        let mut e = engine(0.9);
        let alice = SubjectId::from("alice");
        let t0 = Instant::now();
        e.start_challenge(&alice, t0);
        force_challenge(&mut e, &alice, ChallengeKind::TurnLeft);

        for frame in 0..7u32 {
            let now = t0 + ms(100 * u64::from(frame));
            e.evaluate(&alice, &region(), &satisfying_box(ChallengeKind::TurnLeft, frame), &region(), now);
        }
        // Back at the baseline: combined 0.54 still passes, movement does not.
        let out = e.evaluate(&alice, &region(), &box_at(300, 240), &region(), t0 + ms(700));
        assert!(!out.verified);
        assert!(out.score >= 0.4);
        assert_eq!(e.subject_state(&alice).unwrap().consecutive_real_frames, 8);
        assert!(e.is_active(&alice));
    }

    #[test]
    fn test_counter_bounded_by_frames_evaluated() {
        // 0.5 * 0.6 = 0.3 fails alone; with movement 0.7 passes.
        let mut e = engine(0.5);
        let alice = SubjectId::from("alice");
        let t0 = Instant::now();
        e.start_challenge(&alice, t0);
        force_challenge(&mut e, &alice, ChallengeKind::MoveCloser);
        let mut peak = 0;
        let mut leaked = false;
        for frame in 0..12u32 {
            let b = if frame % 3 == 2 {
                box_at(300, 240)
            } else {
                satisfying_box(ChallengeKind::MoveCloser, frame)
            };
            let before = e.subject_state(&alice).unwrap().consecutive_real_frames;
            let out = e.evaluate(&alice, &region(), &b, &region(), t0 + ms(10 * u64::from(frame)));
            assert!(!out.verified);
            let s = e.subject_state(&alice).unwrap();
            assert!(s.consecutive_real_frames <= s.frames_evaluated);
            leaked |= s.consecutive_real_frames < before;
            peak = peak.max(s.consecutive_real_frames);
        }
        assert_eq!(peak, 4);
        assert!(leaked);
    }

    #[test]
    fn test_active_subject_survives_eviction() {
        let config = LivenessConfig {
            max_subjects: 2,
            ..LivenessConfig::default()
        };
        let mut e = LivenessEngine::with_rng(&config, StdRng::seed_from_u64(42))
            .with_scorer(Box::new(FixedScore(0.9)));
        let alice = SubjectId::from("alice");
        let bob = SubjectId::from("bob");
        let carol = SubjectId::from("carol");
        let t0 = Instant::now();
        e.start_challenge(&alice, t0);
        e.start_challenge(&bob, t0);
        for frame in 0..3u64 {
            e.evaluate(&alice, &region(), &box_at(300, 240), &region(), t0 + ms(10 * frame));
        }
        e.start_challenge(&carol, t0 + ms(50));
        assert!(e.is_active(&alice));
        assert_eq!(e.subject_state(&alice).unwrap().frames_evaluated, 3);
        assert!(e.subject_state(&bob).is_none());
    }

    #[test]
    fn test_strict_config_selects_screen_aware_scorer() {
        // Grey noise with a strong blue cast: full texture, poor colour balance.
        let mut rng = StdRng::seed_from_u64(7);
        let bluish = RgbImage::from_fn(40, 40, |_, _| {
            let v: u8 = rng.gen();
            image::Rgb([v / 4, v / 2, v])
        });
        let first_frame_score = |strict: bool| {
            let mut config = LivenessConfig::default();
            config.spoof.strict = strict;
            let mut e = LivenessEngine::with_rng(&config, StdRng::seed_from_u64(1));
            let alice = SubjectId::from("alice");
            let t0 = Instant::now();
            e.start_challenge(&alice, t0);
            // First sighting seeds the baseline, so only the spoof term counts.
            e.evaluate(&alice, &bluish, &box_at(20, 20), &bluish, t0).score
        };
        let lenient = first_frame_score(false);
        let strict = first_frame_score(true);
        assert!(lenient > 0.36, "lenient {lenient}");
        assert!(strict < lenient, "strict {strict} lenient {lenient}");
    }

    #[test]
    fn test_status_reports_progress() {
        let mut e = engine(0.9);
        let alice = SubjectId::from("alice");
        let t0 = Instant::now();
        e.start_challenge(&alice, t0);
        force_challenge(&mut e, &alice, ChallengeKind::TurnRight);
        e.evaluate(&alice, &region(), &box_at(300, 240), &region(), t0);
        let out = e.evaluate(&alice, &region(), &box_at(300, 240), &region(), t0 + ms(10));
        assert_eq!(out.status, "Turn your head RIGHT (25%)");
        assert_eq!(
            e.status_text(&alice, t0 + ms(1_000)),
            "Turn your head RIGHT (25% - 4.0s)"
        );
    }

    fn verified_engine(t0: Instant) -> (LivenessEngine, SubjectId) {
        let mut e = engine(0.9);
        let alice = SubjectId::from("alice");
        e.start_challenge(&alice, t0);
        force_challenge(&mut e, &alice, ChallengeKind::TurnLeft);
        for frame in 0..8u32 {
            e.evaluate(
                &alice,
                &region(),
                &satisfying_box(ChallengeKind::TurnLeft, frame),
                &region(),
                t0,
            );
        }
        assert!(e.is_verified(&alice, t0));
        (e, alice)
    }

    #[test]
    fn test_rearm_suppressed_within_cooldown() {
        let t0 = Instant::now();
        let (mut e, alice) = verified_engine(t0);
        assert_eq!(e.start_challenge(&alice, t0 + ms(1_000)), None);
        assert_eq!(e.start_challenge(&alice, t0 + ms(29_000)), None);
        assert!(e.is_verified(&alice, t0 + ms(29_000)));
        assert!(e.start_challenge(&alice, t0 + ms(30_000)).is_some());
    }

    #[test]
    fn test_verification_expires_lazily() {
        let t0 = Instant::now();
        let (mut e, alice) = verified_engine(t0);
        assert!(e.is_verified(&alice, t0 + ms(59_999)));
        assert!(e.subject_state(&alice).unwrap().verified);
        assert!(!e.is_verified(&alice, t0 + ms(60_000)));
        assert!(!e.subject_state(&alice).unwrap().verified);
    }

    #[test]
    fn test_reset_clears_verification_and_cooldown() {
        let t0 = Instant::now();
        let (mut e, alice) = verified_engine(t0);
        e.reset(&alice);
        assert!(!e.is_verified(&alice, t0));
        assert!(e.start_challenge(&alice, t0 + ms(1)).is_some());
        assert!(e.is_active(&alice));
    }

    #[test]
    fn test_unknown_subject_status() {
        let e = engine(0.9);
        assert_eq!(e.status_text(&"nobody".into(), Instant::now()), "Ready for verification");
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let config = LivenessConfig::default();
        let draw = |seed| {
            let mut e = LivenessEngine::with_rng(&config, StdRng::seed_from_u64(seed));
            let t0 = Instant::now();
            (0..6)
                .map(|i| {
                    let id = SubjectId::new(format!("s{i}"));
                    e.start_challenge(&id, t0);
                    e.challenge(&id).unwrap()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }
}
