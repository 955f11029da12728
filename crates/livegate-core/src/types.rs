use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an enrolled subject, as produced by the identity resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Face bounding box in pixel coordinates, `(top, right, bottom, left)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceBox {
    pub const fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width()) * i64::from(self.height())
    }

    /// Integer centroid, floored like the detector's own pixel grid.
    pub fn center(&self) -> (i32, i32) {
        (
            (self.left + self.right).div_euclid(2),
            (self.top + self.bottom).div_euclid(2),
        )
    }

    /// Map a box found on a downscaled frame back to source resolution.
    pub fn rescale(&self, scale_x: f32, scale_y: f32) -> Self {
        Self {
            top: (self.top as f32 * scale_y) as i32,
            right: (self.right as f32 * scale_x) as i32,
            bottom: (self.bottom as f32 * scale_y) as i32,
            left: (self.left as f32 * scale_x) as i32,
        }
    }

    /// Crop this box plus `margin` pixels on every side, clamped to the frame.
    ///
    /// Returns an empty image when the clamped region has no area.
    pub fn crop_from(&self, frame: &RgbImage, margin: i32) -> RgbImage {
        let (fw, fh) = (frame.width() as i32, frame.height() as i32);
        let x0 = (self.left - margin).clamp(0, fw);
        let y0 = (self.top - margin).clamp(0, fh);
        let x1 = (self.right + margin).clamp(0, fw);
        let y1 = (self.bottom + margin).clamp(0, fh);
        if x1 <= x0 || y1 <= y0 {
            return RgbImage::new(0, 0);
        }
        image::imageops::crop_imm(
            frame,
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        )
        .to_image()
    }
}

/// A 2D point with floating-point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// One face returned by the external detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub embedding: Vec<f32>,
}

/// Outcome of matching a face embedding against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Known {
        subject: SubjectId,
        /// Match accuracy in percent.
        accuracy: f32,
    },
    Unknown,
}

impl Identity {
    pub fn subject(&self) -> Option<&SubjectId> {
        match self {
            Identity::Known { subject, .. } => Some(subject),
            Identity::Unknown => None,
        }
    }

    pub fn accuracy(&self) -> f32 {
        match self {
            Identity::Known { accuracy, .. } => *accuracy,
            Identity::Unknown => 0.0,
        }
    }
}
