use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Tracker, matcher and registration tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum IoU for a detection to continue an existing track.
    pub tracking_iou_threshold: f32,
    /// Unmatched tracks idle for longer than this are dropped.
    pub stale_track_secs: f64,
    /// Embeddings averaged into one representative vector.
    pub collection_window: usize,
    /// Length of the similarity/match history used for consensus.
    pub evaluation_frames: usize,
    /// Per-embedding similarity that counts as a match.
    pub recognition_threshold: f32,
    /// Averaged similarity that commits a recognition immediately.
    pub high_confidence_threshold: f32,
    /// Similarity that short-circuits the consensus window.
    pub instant_match_threshold: f32,
    /// A registration closer than this to any stored embedding is a duplicate.
    pub duplicate_registration_threshold: f32,
    /// Stored embeddings per person beyond which continuous learning stops.
    pub max_embeddings_per_person: usize,
    /// Averaged windows saved right after a new registration.
    pub post_registration_rounds: u32,
    /// Minimum gap between two registrations.
    pub registration_cooldown_secs: f64,
    /// Floor for the confidence shown for Unknown/Ambiguous tracks.
    pub display_confidence: f32,
    /// Keep the most centred recognised face as the active person.
    pub prefer_centered_face: bool,
    pub quality: QualityConfig,
}

/// Quality gate limits. Pose limits only apply during registration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_brightness: f32,
    pub max_brightness: f32,
    pub min_laplacian_variance: f32,
    pub min_face_size: u32,
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    pub max_eye_angle_deg: f32,
    pub min_eye_distance_ratio: f32,
    pub max_nose_offset_ratio: f32,
    pub min_vertical_ratio: f32,
    pub max_vertical_ratio: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tracking_iou_threshold: 0.5,
            stale_track_secs: 1.0,
            collection_window: 30,
            evaluation_frames: 5,
            recognition_threshold: 0.85,
            high_confidence_threshold: 0.90,
            instant_match_threshold: 0.99,
            duplicate_registration_threshold: 0.85,
            max_embeddings_per_person: 30,
            post_registration_rounds: 5,
            registration_cooldown_secs: 2.0,
            display_confidence: 0.01,
            prefer_centered_face: true,
            quality: QualityConfig::default(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            min_brightness: 65.0,
            max_brightness: 165.0,
            min_laplacian_variance: 20.0,
            min_face_size: 80,
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 1.5,
            max_eye_angle_deg: 10.0,
            min_eye_distance_ratio: 0.25,
            max_nose_offset_ratio: 0.08,
            min_vertical_ratio: 0.8,
            max_vertical_ratio: 1.5,
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.collection_window == 0 {
            return Err(Error::Config("collection_window must be positive".into()));
        }
        if self.evaluation_frames == 0 {
            return Err(Error::Config("evaluation_frames must be positive".into()));
        }
        let unit = [
            ("tracking_iou_threshold", self.tracking_iou_threshold),
            ("recognition_threshold", self.recognition_threshold),
            ("high_confidence_threshold", self.high_confidence_threshold),
            ("instant_match_threshold", self.instant_match_threshold),
            ("duplicate_registration_threshold", self.duplicate_registration_threshold),
            ("display_confidence", self.display_confidence),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        if self.recognition_threshold > self.high_confidence_threshold
            || self.high_confidence_threshold > self.instant_match_threshold
        {
            return Err(Error::Config(
                "expected recognition <= high_confidence <= instant_match thresholds".into(),
            ));
        }
        if self.stale_track_secs < 0.0 || self.registration_cooldown_secs < 0.0 {
            return Err(Error::Config("time limits must not be negative".into()));
        }
        let q = &self.quality;
        if q.min_brightness > q.max_brightness
            || q.min_aspect_ratio > q.max_aspect_ratio
            || q.min_vertical_ratio > q.max_vertical_ratio
        {
            return Err(Error::Config("quality bounds are inverted".into()));
        }
        Ok(())
    }
}
