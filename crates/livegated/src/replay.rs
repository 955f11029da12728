//! Replay collaborators: frames from a directory, detections and landmarks
//! from a JSON sidecar next to each frame.
//!
//! A frame `0001.png` is annotated by `0001.json`:
//!
//! ```json
//! {
//!   "width": 640, "height": 480,
//!   "faces": [
//!     { "bbox": { "top": 120, "right": 380, "bottom": 320, "left": 260 },
//!       "embedding": [0.1, 0.2],
//!       "landmarks": [{ "x": 271.0, "y": 180.5 }] }
//!   ]
//! }
//! ```
//!
//! Coordinates are in the `width`x`height` space and are rescaled to
//! whatever image the engine hands in, so detection on a downscaled frame
//! works unchanged. A frame without a sidecar has no faces.

use image::RgbImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use livegate_core::{
    CameraError, DetectError, DetectedFace, FaceBox, FaceDetector, FrameSource,
    LandmarkExtractor, Landmarks, Point,
};

/// Maximum center distance, in frame pixels, between a requested box and an
/// annotated face for its landmarks to be used.
const LANDMARK_MATCH_RADIUS: f32 = 30.0;

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read replay directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no frames found in {0}")]
    Empty(PathBuf),
    #[error("failed to read annotation {path}: {source}")]
    AnnotationIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid annotation {path}: {source}")]
    AnnotationParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct AnnotatedFace {
    bbox: FaceBox,
    #[serde(default)]
    embedding: Vec<f32>,
    #[serde(default)]
    landmarks: Vec<Point>,
}

#[derive(Debug, Clone, Deserialize)]
struct FrameAnnotation {
    width: u32,
    height: u32,
    #[serde(default)]
    faces: Vec<AnnotatedFace>,
}

impl FrameAnnotation {
    fn scale_to(&self, image: &RgbImage) -> (f32, f32) {
        (
            image.width() as f32 / self.width.max(1) as f32,
            image.height() as f32 / self.height.max(1) as f32,
        )
    }
}

/// Annotations indexed by frame position, shared by detector and landmarks.
struct Annotations {
    frames: Vec<Option<FrameAnnotation>>,
    /// Index of the frame most recently read from the source.
    cursor: Arc<AtomicUsize>,
}

impl Annotations {
    fn current(&self) -> Option<&FrameAnnotation> {
        self.frames
            .get(self.cursor.load(Ordering::Acquire))
            .and_then(Option::as_ref)
    }
}

/// Reads image files of a directory in lexical order.
pub struct DirectoryFrameSource {
    frames: Vec<PathBuf>,
    next: usize,
    cursor: Arc<AtomicUsize>,
}

impl FrameSource for DirectoryFrameSource {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let path = self.frames.get(self.next).ok_or(CameraError::Exhausted)?;
        let image = image::open(path).map_err(|source| CameraError::Decode {
            path: path.clone(),
            source,
        })?;
        self.cursor.store(self.next, Ordering::Release);
        self.next += 1;
        Ok(image.to_rgb8())
    }
}

pub struct AnnotatedDetector {
    annotations: Arc<Annotations>,
}

impl FaceDetector for AnnotatedDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectError> {
        let Some(annotation) = self.annotations.current() else {
            return Ok(Vec::new());
        };
        let (sx, sy) = annotation.scale_to(frame);
        Ok(annotation
            .faces
            .iter()
            .map(|face| DetectedFace {
                bbox: face.bbox.rescale(sx, sy),
                embedding: face.embedding.clone(),
            })
            .collect())
    }
}

pub struct AnnotatedLandmarks {
    annotations: Arc<Annotations>,
}

impl LandmarkExtractor for AnnotatedLandmarks {
    fn landmarks(&mut self, frame: &RgbImage, face: &FaceBox) -> Result<Landmarks, DetectError> {
        let annotation = self
            .annotations
            .current()
            .ok_or(DetectError::NoMatchingFace(*face))?;
        let (sx, sy) = annotation.scale_to(frame);
        let (cx, cy) = face.center();
        let target = Point::new(cx as f32, cy as f32);

        let nearest = annotation
            .faces
            .iter()
            .map(|f| {
                let (x, y) = f.bbox.rescale(sx, sy).center();
                (f, Point::new(x as f32, y as f32).distance(&target))
            })
            .filter(|(_, d)| *d <= LANDMARK_MATCH_RADIUS)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(f, _)| f)
            .ok_or(DetectError::NoMatchingFace(*face))?;

        Landmarks::new(
            nearest
                .landmarks
                .iter()
                .map(|p| Point::new(p.x * sx, p.y * sy))
                .collect(),
        )
    }
}

/// Open a replay directory: the frame source plus the detector and landmark
/// extractor that follow it frame by frame.
pub fn open(
    dir: &Path,
) -> Result<(DirectoryFrameSource, AnnotatedDetector, AnnotatedLandmarks), ReplayError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ReplayError::Dir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut frames = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| ReplayError::Dir {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_frame {
            frames.push(path);
        }
    }
    if frames.is_empty() {
        return Err(ReplayError::Empty(dir.to_path_buf()));
    }
    frames.sort();

    let annotations = frames
        .iter()
        .map(|frame| load_annotation(&frame.with_extension("json")))
        .collect::<Result<Vec<_>, _>>()?;
    let annotated = annotations.iter().filter(|a| a.is_some()).count();
    tracing::info!(
        dir = %dir.display(),
        frames = frames.len(),
        annotated,
        "replay opened"
    );

    let cursor = Arc::new(AtomicUsize::new(0));
    let annotations = Arc::new(Annotations {
        frames: annotations,
        cursor: Arc::clone(&cursor),
    });
    Ok((
        DirectoryFrameSource {
            frames,
            next: 0,
            cursor,
        },
        AnnotatedDetector {
            annotations: Arc::clone(&annotations),
        },
        AnnotatedLandmarks { annotations },
    ))
}

fn load_annotation(path: &Path) -> Result<Option<FrameAnnotation>, ReplayError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ReplayError::AnnotationIo {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| ReplayError::AnnotationParse {
            path: path.to_path_buf(),
            source,
        })
}
