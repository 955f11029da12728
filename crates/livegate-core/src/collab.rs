//! Seams to the external collaborators the engine depends on.
//!
//! The engine owns no camera, detector, or matcher. The daemon plugs concrete
//! implementations in at these traits; tests plug stubs.

use image::RgbImage;

use crate::blink::Landmarks;
use crate::error::{CameraError, DetectError};
use crate::types::{DetectedFace, FaceBox, Identity};

/// Produces frames for the frame loop. A read failure ends the loop.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;
}

/// Locates faces and computes their embeddings.
///
/// Boxes are in the coordinates of the image passed in.
pub trait FaceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectError>;
}

/// Extracts the 68-point landmark set for one face.
pub trait LandmarkExtractor {
    fn landmarks(&mut self, frame: &RgbImage, face: &FaceBox) -> Result<Landmarks, DetectError>;
}

/// Maps a face embedding to an enrolled subject.
pub trait IdentityResolver {
    fn resolve(&self, embedding: &[f32]) -> Identity;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        (**self).read_frame()
    }
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, DetectError> {
        (**self).detect(frame)
    }
}

impl<T: LandmarkExtractor + ?Sized> LandmarkExtractor for Box<T> {
    fn landmarks(&mut self, frame: &RgbImage, face: &FaceBox) -> Result<Landmarks, DetectError> {
        (**self).landmarks(frame, face)
    }
}

impl<T: IdentityResolver + ?Sized> IdentityResolver for Box<T> {
    fn resolve(&self, embedding: &[f32]) -> Identity {
        (**self).resolve(embedding)
    }
}
