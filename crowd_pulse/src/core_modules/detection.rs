// THEORY:
// This module is the boundary to the person detector. The detector itself is a
// black box; all the pipeline assumes is the `Detector` trait below. Everything
// the detector returns is treated as untrusted: raw boxes are validated once here
// and turned into `Detection`s with their derived geometry, so the analyzers
// downstream never see NaNs or inverted boxes.

use crate::error::DetectError;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// One captured frame, as handed from a source to the analyzer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Position of the frame in its source's capture order.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Utc::now(),
        }
    }

    /// A black frame, for sources that only carry detections.
    pub fn blank(width: u32, height: u32, sequence: u64) -> Self {
        Self::new(RgbImage::new(width, height), sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Detector output before validation: `[x1, y1, x2, y2]` in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            bbox: [x1, y1, x2, y2],
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> [f32; 2] {
        [(self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0]
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// height / width, or 0 for a zero-width box.
    pub fn aspect_ratio(&self) -> f32 {
        let width = self.width();
        if width > 0.0 { self.height() / width } else { 0.0 }
    }
}

/// A validated person detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub center: [f32; 2],
    pub area: f32,
}

impl Detection {
    /// Validates a raw box. Degenerate (zero width or height) boxes are accepted.
    pub fn try_from_raw(raw: &RawDetection) -> Option<Self> {
        let [x1, y1, x2, y2] = raw.bbox;
        let finite = raw.bbox.iter().all(|v| v.is_finite()) && raw.confidence.is_finite();
        if !finite || x2 < x1 || y2 < y1 || !(0.0..=1.0).contains(&raw.confidence) {
            return None;
        }
        let bbox = BBox { x1, y1, x2, y2 };
        Some(Self {
            bbox,
            confidence: raw.confidence,
            center: bbox.center(),
            area: bbox.area(),
        })
    }
}

/// The person detector. Implementations must be usable from several source
/// threads at once.
pub trait Detector: Send + Sync {
    /// Startup check; an error here aborts monitor construction.
    fn warm_up(&self) -> Result<(), DetectError> {
        Ok(())
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectError>;
}

/// Why a frame was analyzed as empty.
#[derive(Debug, Clone)]
pub enum DetectionFault {
    Detector(DetectError),
    Malformed { index: usize, raw: RawDetection },
}

impl std::fmt::Display for DetectionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionFault::Detector(err) => write!(f, "{err}"),
            DetectionFault::Malformed { index, raw } => {
                write!(f, "malformed detection #{index}: {:?} conf {}", raw.bbox, raw.confidence)
            }
        }
    }
}

/// Runs the detector on a frame and validates its output. Any failure turns the
/// frame into an empty one and is returned alongside as a fault.
pub fn detect_frame(detector: &dyn Detector, frame: &Frame) -> (Vec<Detection>, Option<DetectionFault>) {
    match detector.detect(frame) {
        Ok(raw) => validate_all(&raw),
        Err(err) => (Vec::new(), Some(DetectionFault::Detector(err))),
    }
}

pub fn validate_all(raw: &[RawDetection]) -> (Vec<Detection>, Option<DetectionFault>) {
    let mut detections = Vec::with_capacity(raw.len());
    for (index, r) in raw.iter().enumerate() {
        match Detection::try_from_raw(r) {
            Some(d) => detections.push(d),
            None => return (Vec::new(), Some(DetectionFault::Malformed { index, raw: *r })),
        }
    }
    (detections, None)
}

#[cfg(test)]
pub(crate) fn person(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
    Detection::try_from_raw(&RawDetection::new(x1, y1, x2, y2, confidence))
        .expect("test detection must be valid")
}
