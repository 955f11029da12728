use chrono::Local;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use livegate_core::pipeline::calibrate_ear_baseline;
use livegate_core::{
    CameraError, FaceDetector, FrameSource, IdentityResolver, LandmarkExtractor, LivenessConfig,
    LivenessPipeline,
};

use crate::recorder::AttendanceEvent;

/// Everything the engine thread owns for its lifetime.
pub struct EngineParts {
    pub source: Box<dyn FrameSource + Send>,
    pub detector: Box<dyn FaceDetector + Send>,
    pub landmarks: Box<dyn LandmarkExtractor + Send>,
    pub resolver: Box<dyn IdentityResolver + Send>,
    pub config: LivenessConfig,
    pub seed: Option<u64>,
    pub frame_interval: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineSummary {
    pub frames: u64,
    pub confirmations: u64,
}

/// Spawn the frame loop on a dedicated OS thread.
///
/// The thread calibrates the blink baseline, then processes frames until the
/// source fails, `cancel` is set, or the event receiver is dropped. Dropping
/// the thread's sender is what tells the recorder to finish.
pub fn spawn_engine(
    parts: EngineParts,
    cancel: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<AttendanceEvent>,
) -> std::io::Result<JoinHandle<EngineSummary>> {
    std::thread::Builder::new()
        .name("livegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let summary = run(parts, &cancel, &events);
            tracing::info!(
                frames = summary.frames,
                confirmations = summary.confirmations,
                "engine thread exiting"
            );
            summary
        })
}

fn run(
    mut parts: EngineParts,
    cancel: &AtomicBool,
    events: &mpsc::UnboundedSender<AttendanceEvent>,
) -> EngineSummary {
    let baseline = calibrate_ear_baseline(
        &mut *parts.source,
        &mut *parts.detector,
        &mut *parts.landmarks,
        &parts.config.blink,
    );
    let rng = match parts.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut pipeline = LivenessPipeline::with_rng(&parts.config, baseline, rng);
    let mut summary = EngineSummary::default();

    while !cancel.load(Ordering::Relaxed) {
        let frame = match parts.source.read_frame() {
            Ok(frame) => frame,
            Err(CameraError::Exhausted) => {
                tracing::info!("frame source exhausted");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "frame read failed; stopping");
                break;
            }
        };
        let started = Instant::now();
        let report = pipeline.process_frame(
            &frame,
            started,
            &mut *parts.detector,
            &mut *parts.landmarks,
            &*parts.resolver,
        );
        summary.frames += 1;

        tracing::trace!(
            fps = report.fps,
            faces = report.faces.len(),
            stable = report.has_stable_faces,
            "frame processed"
        );
        if report.show_no_face_message {
            tracing::debug!("no face detected");
        }
        for face in &report.faces {
            let [r, g, b] = face.tone.rgb();
            tracing::debug!(
                status = %face.status,
                tone = ?face.tone,
                color = %format!("#{r:02x}{g:02x}{b:02x}"),
                accuracy = face.accuracy,
                "face"
            );
        }

        for confirmation in report.confirmations {
            summary.confirmations += 1;
            let event = AttendanceEvent {
                subject: confirmation.subject,
                recorded_at: Local::now(),
            };
            if events.send(event).is_err() {
                tracing::warn!("recorder gone; stopping engine");
                return summary;
            }
        }

        if let Some(rest) = parts.frame_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use livegate_core::{DetectError, DetectedFace, FaceBox, Identity, Landmarks, Point};

    struct Blank(usize);

    impl FrameSource for Blank {
        fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
            if self.0 == 0 {
                return Err(CameraError::Exhausted);
            }
            self.0 -= 1;
            Ok(RgbImage::new(64, 48))
        }
    }

    struct OneFace;

    impl FaceDetector for OneFace {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectError> {
            Ok(vec![DetectedFace {
                bbox: FaceBox::new(10, 40, 40, 10),
                embedding: vec![0.0],
            }])
        }
    }

    struct NoLandmarks;

    impl LandmarkExtractor for NoLandmarks {
        fn landmarks(&mut self, _frame: &RgbImage, _face: &FaceBox) -> Result<Landmarks, DetectError> {
            Landmarks::new(vec![Point::default(); 3])
        }
    }

    struct Nobody;

    impl IdentityResolver for Nobody {
        fn resolve(&self, _embedding: &[f32]) -> Identity {
            Identity::Unknown
        }
    }

    fn parts(frames: usize) -> EngineParts {
        EngineParts {
            source: Box::new(Blank(frames)),
            detector: Box::new(OneFace),
            landmarks: Box::new(NoLandmarks),
            resolver: Box::new(Nobody),
            config: LivenessConfig::default(),
            seed: Some(1),
            frame_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_runs_until_source_exhausted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_engine(parts(50), Arc::new(AtomicBool::new(false)), tx).unwrap();
        let summary = handle.join().unwrap();
        // The first 20 frames go to calibration.
        assert_eq!(summary.frames, 30);
        assert_eq!(summary.confirmations, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_stops_before_first_frame() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = spawn_engine(parts(50), Arc::new(AtomicBool::new(true)), tx).unwrap();
        assert_eq!(handle.join().unwrap().frames, 0);
    }
}
