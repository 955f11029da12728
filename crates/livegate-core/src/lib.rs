//! Livegate liveness engine.
//!
//! Decides, frame by frame, whether the face in front of a single uncalibrated
//! camera belongs to a live person before unlocking one blink-confirmed
//! attendance action per verification.
//!
//! The pieces, leaf-first:
//!
//! - [`spoof`] scores a cropped face for photo/screen artifacts.
//! - [`movement`] tracks face-box history against a per-challenge baseline.
//! - [`combiner`] fuses both into a leaky-bucket hysteresis counter.
//! - [`challenge`] owns the per-subject challenge state machine.
//! - [`sampling`] throttles detection/verification and caches detections.
//! - [`blink`] turns an eye-closure run into a single confirmation.
//! - [`pipeline`] wires all of the above into one synchronous frame tick.
//!
//! Face detection, landmark extraction and identity matching are external;
//! their seams are the traits in [`collab`].

pub mod blink;
pub mod challenge;
pub mod collab;
pub mod combiner;
pub mod config;
pub mod error;
pub mod movement;
pub mod pipeline;
pub mod sampling;
pub mod spoof;
pub mod store;
pub mod types;

pub use blink::{
    eye_aspect_ratio, BlinkGate, Confirmation, EarCalibrator, Landmarks, VerificationSource,
};
pub use challenge::{ChallengeKind, Evaluation, LivenessEngine, SubjectLivenessState};
pub use collab::{FaceDetector, FrameSource, IdentityResolver, LandmarkExtractor};
pub use combiner::ScoreCombiner;
pub use config::LivenessConfig;
pub use error::{CameraError, DetectError};
pub use movement::MovementAnalyzer;
pub use pipeline::{FaceReport, FrameReport, LivenessPipeline, Tone};
pub use sampling::{DetectionCache, DetectionSnapshot};
pub use spoof::{screen_artifact_score, spoof_score, SpoofScorer};
pub use store::{LruStateStore, StateStore};
pub use types::{DetectedFace, FaceBox, Identity, Point, SubjectId};
