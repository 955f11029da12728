//! One synchronous frame tick: sample, detect or reuse the cache, resolve
//! identities, drive the liveness challenge, then watch for the confirming
//! blink.

use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

use crate::blink::{AlwaysVerified, BlinkGate, Confirmation, EarCalibrator, VerificationSource};
use crate::challenge::LivenessEngine;
use crate::collab::{FaceDetector, FrameSource, IdentityResolver, LandmarkExtractor};
use crate::config::{BlinkConfig, LivenessConfig};
use crate::sampling::{downscale_for_detection, SamplingLayer};
use crate::spoof::SpoofScorer;
use crate::types::{DetectedFace, FaceBox, Identity, SubjectId};

const VERIFIED_LABEL: &str = "VERIFIED - BLINK NOW!";
const ERROR_LABEL: &str = "VERIFICATION ERROR";
const UNKNOWN_LABEL: &str = "Unknown";
const BLINK_LABEL: &str = "BLINK TO CONFIRM";

/// Display category of a face's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Verified,
    Pending,
    Failed,
    Unknown,
    Info,
}

impl Tone {
    /// RGB color for overlays.
    pub fn rgb(self) -> [u8; 3] {
        match self {
            Tone::Verified => [0, 255, 0],
            Tone::Pending => [255, 165, 0],
            Tone::Failed => [255, 0, 0],
            Tone::Unknown => [128, 128, 128],
            Tone::Info => [255, 255, 0],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceReport {
    /// Box in source-frame coordinates.
    pub bbox: FaceBox,
    pub identity: Identity,
    /// Match accuracy in percent, zero for unknown faces.
    pub accuracy: f32,
    pub status: String,
    pub tone: Tone,
}

#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub fps: f32,
    pub has_stable_faces: bool,
    pub show_no_face_message: bool,
    pub faces: Vec<FaceReport>,
    pub confirmations: Vec<Confirmation>,
}

pub struct LivenessPipeline<R = StdRng> {
    require_liveness: bool,
    face_margin: i32,
    detection_size: (u32, u32),
    liveness: LivenessEngine<R>,
    gate: BlinkGate,
    sampling: SamplingLayer,
}

impl LivenessPipeline<StdRng> {
    pub fn new(config: &LivenessConfig, baseline_ear: f32) -> Self {
        Self::with_rng(config, baseline_ear, StdRng::from_entropy())
    }
}

impl<R: Rng> LivenessPipeline<R> {
    pub fn with_rng(config: &LivenessConfig, baseline_ear: f32, rng: R) -> Self {
        Self {
            require_liveness: config.require_liveness,
            face_margin: config.sampling.face_margin,
            detection_size: (
                config.sampling.detection_width,
                config.sampling.detection_height,
            ),
            liveness: LivenessEngine::with_rng(config, rng),
            gate: BlinkGate::new(&config.blink, baseline_ear, config.max_subjects),
            sampling: SamplingLayer::new(&config.sampling, config.max_subjects),
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn SpoofScorer + Send>) -> Self {
        self.liveness = self.liveness.with_scorer(scorer);
        self
    }

    pub fn liveness(&self) -> &LivenessEngine<R> {
        &self.liveness
    }

    pub fn liveness_mut(&mut self) -> &mut LivenessEngine<R> {
        &mut self.liveness
    }

    /// Whether a blink from `subject` would be accepted at `now`.
    pub fn can_confirm(&mut self, subject: &SubjectId, now: Instant) -> bool {
        if self.require_liveness {
            self.gate.can_confirm(&mut self.liveness, subject, now)
        } else {
            self.gate.can_confirm(&mut AlwaysVerified, subject, now)
        }
    }

    pub fn process_frame<D, L, I>(
        &mut self,
        frame: &RgbImage,
        now: Instant,
        detector: &mut D,
        landmarks: &mut L,
        resolver: &I,
    ) -> FrameReport
    where
        D: FaceDetector + ?Sized,
        L: LandmarkExtractor + ?Sized,
        I: IdentityResolver + ?Sized,
    {
        let fps = self.sampling.fps.tick(now);
        let present = if self.sampling.sampler.should_detect(fps) {
            self.detect(frame, now, detector)
        } else {
            self.sampling
                .cache
                .snapshot(now)
                .is_some_and(|s| !s.faces.is_empty())
        };

        let stable = self.sampling.stability.push(present);
        let show_no_face_message = self.sampling.no_face.update(stable, now);
        let verify_sampled = self.sampling.sampler.should_verify(fps);

        let mut report = FrameReport {
            fps,
            has_stable_faces: stable,
            show_no_face_message,
            ..FrameReport::default()
        };
        if !stable {
            return report;
        }
        let Some(snapshot) = self.sampling.cache.snapshot(now) else {
            return report;
        };
        tracing::trace!(
            faces = snapshot.faces.len(),
            confidence = snapshot.confidence,
            "using detection snapshot"
        );

        for face in snapshot.faces.iter() {
            let identity = resolver.resolve(&face.embedding);
            let face_report = match identity.subject().cloned() {
                None => FaceReport {
                    bbox: face.bbox,
                    accuracy: identity.accuracy(),
                    identity,
                    status: UNKNOWN_LABEL.to_string(),
                    tone: Tone::Unknown,
                },
                Some(subject) => {
                    let (status, tone) = self.process_subject(
                        &subject,
                        face,
                        frame,
                        now,
                        verify_sampled,
                        &mut *landmarks,
                        &mut report.confirmations,
                    );
                    FaceReport {
                        bbox: face.bbox,
                        accuracy: identity.accuracy(),
                        identity,
                        status,
                        tone,
                    }
                }
            };
            report.faces.push(face_report);
        }
        report
    }

    /// Run detection on a downscaled copy and refresh the cache.
    ///
    /// Returns whether faces were found. A failed or empty detection leaves
    /// the cache alone to expire on its own.
    fn detect<D: FaceDetector + ?Sized>(
        &mut self,
        frame: &RgbImage,
        now: Instant,
        detector: &mut D,
    ) -> bool {
        let (width, height) = self.detection_size;
        let small = downscale_for_detection(frame, width, height);
        match detector.detect(&small.image) {
            Ok(faces) if faces.is_empty() => false,
            Ok(faces) => {
                let faces: Vec<DetectedFace> = faces
                    .into_iter()
                    .map(|f| DetectedFace {
                        bbox: f.bbox.rescale(small.scale_x, small.scale_y),
                        embedding: f.embedding,
                    })
                    .collect();
                tracing::debug!(faces = faces.len(), "faces detected");
                self.sampling.cache.store(faces, now);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_subject<L: LandmarkExtractor + ?Sized>(
        &mut self,
        subject: &SubjectId,
        face: &DetectedFace,
        frame: &RgbImage,
        now: Instant,
        verify_sampled: bool,
        landmarks: &mut L,
        confirmations: &mut Vec<Confirmation>,
    ) -> (String, Tone) {
        let (status, tone, confirmable) = if !self.require_liveness {
            (BLINK_LABEL.to_string(), Tone::Verified, true)
        } else if self.liveness.is_verified(subject, now) {
            (VERIFIED_LABEL.to_string(), Tone::Verified, true)
        } else if self.sampling.throttle.due(subject, verify_sampled, now) {
            let region = face.bbox.crop_from(frame, self.face_margin);
            let evaluation = self
                .liveness
                .evaluate(subject, frame, &face.bbox, &region, now);
            if evaluation.verified {
                (VERIFIED_LABEL.to_string(), Tone::Verified, true)
            } else {
                if !self.liveness.is_active(subject) {
                    self.liveness.start_challenge(subject, now);
                }
                let (status, tone) = self.pending_label(subject, now);
                (status, tone, false)
            }
        } else {
            let (status, tone) = self.pending_label(subject, now);
            (status, tone, false)
        };

        if !confirmable {
            self.gate.close(subject);
            return (status, tone);
        }

        let points = match landmarks.landmarks(frame, &face.bbox) {
            Ok(points) => points,
            Err(e) => {
                tracing::warn!(subject = %subject, error = %e, "landmark extraction failed");
                return (ERROR_LABEL.to_string(), Tone::Failed);
            }
        };
        let ear = points.mean_ear();
        let mut always = AlwaysVerified;
        let verifier: &mut dyn VerificationSource = if self.require_liveness {
            &mut self.liveness
        } else {
            &mut always
        };
        if let Some(confirmation) = self.gate.observe(verifier, subject, ear, now) {
            confirmations.push(confirmation);
        }
        (status, tone)
    }

    fn pending_label(&self, subject: &SubjectId, now: Instant) -> (String, Tone) {
        match self.liveness.challenge(subject) {
            Some(kind) if self.liveness.is_active(subject) => {
                (kind.prompt().to_string(), Tone::Pending)
            }
            _ => (self.liveness.status_text(subject, now), Tone::Info),
        }
    }
}

/// Average the mean EAR over the first calibration frames that show a face.
///
/// Falls back to the configured default when calibration is disabled, no
/// face is seen, or the frame source fails partway.
pub fn calibrate_ear_baseline<S, D, L>(
    source: &mut S,
    detector: &mut D,
    landmarks: &mut L,
    config: &BlinkConfig,
) -> f32
where
    S: FrameSource + ?Sized,
    D: FaceDetector + ?Sized,
    L: LandmarkExtractor + ?Sized,
{
    if !config.dynamic_calibration {
        return config.default_ear;
    }
    let mut calibrator = EarCalibrator::new(config);
    while !calibrator.is_complete() {
        let frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "EAR calibration aborted");
                break;
            }
        };
        let ear = match detector.detect(&frame) {
            Ok(faces) => faces.first().and_then(|face| {
                landmarks
                    .landmarks(&frame, &face.bbox)
                    .map(|l| l.mean_ear())
                    .map_err(|e| tracing::debug!(error = %e, "calibration frame skipped"))
                    .ok()
            }),
            Err(e) => {
                tracing::debug!(error = %e, "calibration frame skipped");
                None
            }
        };
        calibrator.observe(ear);
    }
    let baseline = calibrator.baseline();
    tracing::info!(baseline_ear = baseline, "EAR baseline calibrated");
    baseline
}
