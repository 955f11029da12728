use std::path::PathBuf;
use thiserror::Error;

/// Failure of an external detection or landmark collaborator.
///
/// These never escape a frame tick: the pipeline downgrades them to a
/// rejecting status for the affected face.
#[derive(Error, Debug)]
pub enum DetectError {
    #[error("face detector failed: {0}")]
    Detector(String),
    #[error("landmark extraction failed: {0}")]
    Landmarks(String),
    #[error("expected 68 landmarks, got {0}")]
    LandmarkCount(usize),
    #[error("no landmarks for face at {0:?}")]
    NoMatchingFace(crate::types::FaceBox),
}

/// Failure to read the next frame. Fatal to the frame loop.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("frame source exhausted")]
    Exhausted,
    #[error("failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("camera I/O error: {0}")]
    Io(#[from] std::io::Error),
}
