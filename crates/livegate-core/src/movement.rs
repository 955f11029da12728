//! Active liveness via challenge-specific head movement.
//!
//! A photograph can be slid around in front of the camera, but it cannot
//! answer an unpredictable instruction on cue. Each challenge is judged against
//! the face position captured at the first sighting after the challenge
//! starts, never against the previous frame: what counts is net displacement
//! from where the subject started, not frame-to-frame jitter.

use std::collections::VecDeque;
use std::time::Instant;

use crate::challenge::ChallengeKind;
use crate::config::ChallengeConfig;
use crate::types::FaceBox;

/// Face centroid and box area at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub size: i64,
    pub at: Instant,
}

impl Position {
    pub fn from_box(face_box: &FaceBox, at: Instant) -> Self {
        let (x, y) = face_box.center();
        Self {
            x,
            y,
            size: face_box.area(),
            at,
        }
    }
}

/// Baseline plus bounded position history for one challenge lifetime.
#[derive(Debug, Clone, Default)]
pub struct MovementTrack {
    baseline: Option<Position>,
    history: VecDeque<Position>,
}

impl MovementTrack {
    pub fn baseline(&self) -> Option<&Position> {
        self.baseline.as_ref()
    }

    pub fn history(&self) -> &VecDeque<Position> {
        &self.history
    }
}

#[derive(Debug, Clone)]
pub struct MovementAnalyzer {
    threshold: i32,
    closer_ratio: f64,
    nod_window: usize,
    capacity: usize,
    min_history: usize,
}

impl Default for MovementAnalyzer {
    fn default() -> Self {
        Self::new(&ChallengeConfig::default())
    }
}

impl MovementAnalyzer {
    pub fn new(config: &ChallengeConfig) -> Self {
        Self {
            threshold: config.motion_threshold,
            closer_ratio: config.closer_ratio,
            nod_window: config.nod_window.max(1),
            capacity: config.history_len.max(1),
            min_history: config.min_history,
        }
    }

    /// Record `face_box` and report whether `challenge` is now satisfied.
    ///
    /// The first sighting only seeds the baseline. Until `min_history`
    /// samples exist no judgement is made.
    pub fn observe(
        &self,
        track: &mut MovementTrack,
        challenge: ChallengeKind,
        face_box: &FaceBox,
        now: Instant,
    ) -> bool {
        let current = Position::from_box(face_box, now);

        let Some(baseline) = track.baseline else {
            track.baseline = Some(current);
            track.history.clear();
            track.history.push_back(current);
            return false;
        };

        track.history.push_back(current);
        while track.history.len() > self.capacity {
            track.history.pop_front();
        }

        if track.history.len() < self.min_history {
            return false;
        }

        match challenge {
            ChallengeKind::TurnLeft => current.x < baseline.x - self.threshold,
            ChallengeKind::TurnRight => current.x > baseline.x + self.threshold,
            ChallengeKind::MoveCloser => current.size as f64 > baseline.size as f64 * self.closer_ratio,
            ChallengeKind::NodHead => {
                let recent = track
                    .history
                    .iter()
                    .rev()
                    .take(self.nod_window)
                    .map(|p| p.y);
                let (min, max) = recent.fold((i32::MAX, i32::MIN), |(lo, hi), y| {
                    (lo.min(y), hi.max(y))
                });
                max - min > self.threshold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Helper: a 100×100 box centred on (x, y).
    fn box_at(x: i32, y: i32) -> FaceBox {
        FaceBox::new(y - 50, x + 50, y + 50, x - 50)
    }

    fn feed(challenge: ChallengeKind, boxes: &[FaceBox]) -> Vec<bool> {
        let analyzer = MovementAnalyzer::default();
        let mut track = MovementTrack::default();
        let t0 = Instant::now();
        boxes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                analyzer.observe(&mut track, challenge, b, t0 + Duration::from_millis(i as u64 * 100))
            })
            .collect()
    }

    #[test]
    fn test_first_sighting_sets_baseline() {
        let analyzer = MovementAnalyzer::default();
        let mut track = MovementTrack::default();
        let b = box_at(300, 200);
        assert!(!analyzer.observe(&mut track, ChallengeKind::TurnLeft, &b, Instant::now()));
        assert_eq!(track.baseline().map(|p| p.x), Some(300));
        assert_eq!(track.history().len(), 1);
    }

    #[test]
    fn test_needs_three_samples() {
        // Moved far enough on the second frame, but only two samples exist.
        let out = feed(ChallengeKind::TurnLeft, &[box_at(300, 200), box_at(250, 200)]);
        assert_eq!(out, vec![false, false]);
    }

    #[test]
    fn test_turn_left_past_threshold() {
        let out = feed(
            ChallengeKind::TurnLeft,
            &[box_at(300, 200), box_at(300, 200), box_at(285, 200)],
        );
        assert!(out[2]);
    }

    #[test]
    fn test_turn_left_within_threshold() {
        let out = feed(
            ChallengeKind::TurnLeft,
            &[box_at(300, 200), box_at(300, 200), box_at(295, 200)],
        );
        assert!(!out[2]);
    }

    #[test]
    fn test_turn_right() {
        let out = feed(
            ChallengeKind::TurnRight,
            &[box_at(300, 200), box_at(305, 200), box_at(313, 200)],
        );
        assert!(out[2]);
        let out = feed(
            ChallengeKind::TurnRight,
            &[box_at(300, 200), box_at(305, 200), box_at(285, 200)],
        );
        assert!(!out[2]);
    }

    #[test]
    fn test_move_closer_needs_ten_percent() {
        let base = FaceBox::new(0, 100, 100, 0); // area 10_000
        let grown = FaceBox::new(0, 105, 105, 0); // 11_025
        let barely = FaceBox::new(0, 104, 105, 0); // 10_920
        assert!(feed(ChallengeKind::MoveCloser, &[base, base, grown])[2]);
        assert!(!feed(ChallengeKind::MoveCloser, &[base, base, barely])[2]);
    }

    #[test]
    fn test_nod_uses_recent_window() {
        let out = feed(
            ChallengeKind::NodHead,
            &[box_at(300, 200), box_at(300, 210), box_at(300, 220)],
        );
        assert_eq!(out, vec![false, false, true]);
    }

    #[test]
    fn test_nod_forgets_old_samples() {
        // The dip at y=230 falls out of the last-5 window by the final frame.
        let boxes = [
            box_at(300, 200),
            box_at(300, 230),
            box_at(300, 200),
            box_at(300, 200),
            box_at(300, 200),
            box_at(300, 200),
            box_at(300, 200),
        ];
        let out = feed(ChallengeKind::NodHead, &boxes);
        assert!(out[2]);
        assert!(!out[6]);
    }

    #[test]
    fn test_displacement_measured_from_baseline() {
        // Each 5px step is below the threshold; against the baseline they add up.
        let boxes: Vec<FaceBox> = (0..5).map(|i| box_at(300 - i * 5, 200)).collect();
        let out = feed(ChallengeKind::TurnLeft, &boxes);
        assert_eq!(out, vec![false, false, false, true, true]);
    }

    #[test]
    fn test_history_is_bounded() {
        let boxes: Vec<FaceBox> = (0..25).map(|_| box_at(300, 200)).collect();
        let analyzer = MovementAnalyzer::default();
        let mut track = MovementTrack::default();
        let now = Instant::now();
        for b in &boxes {
            analyzer.observe(&mut track, ChallengeKind::TurnLeft, b, now);
        }
        assert_eq!(track.history().len(), 10);
    }
}
