use nalgebra::{Point2, SVector};

use crate::error::{Error, Result};
use crate::quality::FaceCrop;
use crate::utils::Embedding;

/// Five-point facial landmarks: left eye, right eye, nose, left mouth corner,
/// right mouth corner. Coordinates are relative to the face crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks {
    pub left_eye: Point2<f32>,
    pub right_eye: Point2<f32>,
    pub nose: Point2<f32>,
    pub left_mouth: Point2<f32>,
    pub right_mouth: Point2<f32>,
}

impl Landmarks {
    pub fn from_points(points: [[f32; 2]; 5]) -> Self {
        let p = |i: usize| Point2::new(points[i][0], points[i][1]);
        Landmarks {
            left_eye: p(0),
            right_eye: p(1),
            nose: p(2),
            left_mouth: p(3),
            right_mouth: p(4),
        }
    }
}

/// Raw detector output that travels with each face.
#[derive(Debug, Clone, Default)]
pub struct DetectorOutput {
    pub score: f32,
    pub landmarks: Option<Landmarks>,
    /// Some detectors (InsightFace and friends) emit a recognition embedding
    /// alongside the box.
    pub embedding: Option<Vec<f32>>,
}

/// A single face detection result.
#[derive(Debug, Clone)]
pub struct Detection {
    pub crop: FaceCrop,
    /// Bounding box as [x1, y1, x2, y2] in frame pixels.
    pub tlbr: SVector<f32, 4>,
    pub meta: DetectorOutput,
}

impl Detection {
    pub fn new(crop: FaceCrop, tlbr: SVector<f32, 4>, meta: DetectorOutput) -> Self {
        Self { crop, tlbr, meta }
    }

    pub fn tlbr(&self) -> &SVector<f32, 4> {
        &self.tlbr
    }

    pub fn landmarks(&self) -> Option<&Landmarks> {
        self.meta.landmarks.as_ref()
    }
}

/// Turns a detected face into an embedding.
pub trait FeatureExtractor {
    fn extract(&mut self, detection: &Detection) -> Result<Embedding>;
}

/// Uses the embedding the detector already attached to the detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorEmbedding;

impl FeatureExtractor for DetectorEmbedding {
    fn extract(&mut self, detection: &Detection) -> Result<Embedding> {
        detection
            .meta
            .embedding
            .as_ref()
            .map(|v| Embedding::from_column_slice(v))
            .ok_or_else(|| Error::Extractor("detector produced no embedding".into()))
    }
}
