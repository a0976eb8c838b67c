//! Per-frame face quality gate.
//!
//! A frame only contributes an embedding when its crop is well lit, sharp,
//! large enough and plausibly shaped. Registration additionally requires a
//! frontal pose, judged from the five detector landmarks. Rejections are
//! ordinary values: the caller skips the frame and tries again on the next one.

use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(feature = "opencv")]
use tracing::warn;

use crate::config::QualityConfig;
use crate::detection::Landmarks;
use crate::error::{Error as CrateError, Result};

/// Owned 8-bit grayscale face crop, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCrop")]
pub struct FaceCrop {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

#[derive(Deserialize)]
struct RawCrop {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl TryFrom<RawCrop> for FaceCrop {
    type Error = CrateError;

    fn try_from(raw: RawCrop) -> Result<Self> {
        FaceCrop::new(raw.width, raw.height, raw.pixels)
    }
}

impl FaceCrop {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() != (width as usize) * (height as usize) {
            return Err(CrateError::InvalidCrop("buffer does not match its dimensions"));
        }
        Ok(FaceCrop { width, height, pixels })
    }

    /// Build a crop from a per-pixel function of (x, y).
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        FaceCrop { width, height, pixels }
    }

    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        FaceCrop { width, height, pixels: vec![value; width as usize * height as usize] }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    fn at(&self, x: usize, y: usize) -> f64 {
        self.pixels[y * self.width as usize + x] as f64
    }

    /// Mean grey level in [0, 255].
    pub fn brightness(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        #[cfg(feature = "opencv")]
        match self.cv_brightness() {
            Ok(v) => return v,
            Err(e) => warn!(error = %e, "opencv mean failed, using fallback"),
        }
        self.brightness_fallback()
    }

    fn brightness_fallback(&self) -> f32 {
        let sum: u64 = self.pixels.iter().map(|&p| p as u64).sum();
        (sum as f64 / self.pixels.len() as f64) as f32
    }

    /// Variance of the 4-neighbour Laplacian response, borders reflected
    /// without repeating the edge pixel. Low values mean a blurry crop.
    pub fn laplacian_variance(&self) -> f32 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        #[cfg(feature = "opencv")]
        match self.cv_laplacian_variance() {
            Ok(v) => return v,
            Err(e) => warn!(error = %e, "opencv laplacian failed, using fallback"),
        }
        self.laplacian_variance_fallback()
    }

    fn laplacian_variance_fallback(&self) -> f32 {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for y in 0..h {
            for x in 0..w {
                let up = self.at(x, reflect101(y as isize - 1, h));
                let down = self.at(x, reflect101(y as isize + 1, h));
                let left = self.at(reflect101(x as isize - 1, w), y);
                let right = self.at(reflect101(x as isize + 1, w), y);
                let lap = up + down + left + right - 4.0 * self.at(x, y);
                sum += lap;
                sum_sq += lap * lap;
            }
        }
        let n = (w * h) as f64;
        let mean = sum / n;
        (sum_sq / n - mean * mean).max(0.0) as f32
    }

    #[cfg(feature = "opencv")]
    fn cv_brightness(&self) -> opencv::Result<f32> {
        use opencv::core;

        let src = core::Mat::new_rows_cols_with_data(self.height as i32, self.width as i32, self.pixels.as_slice())?;
        Ok(core::mean(&*src, &core::no_array())?[0] as f32)
    }

    /// `Laplacian(CV_64F, ksize = 1)` then `meanStdDev`; variance is stddev squared.
    #[cfg(feature = "opencv")]
    fn cv_laplacian_variance(&self) -> opencv::Result<f32> {
        use opencv::{core, imgproc};

        let src = core::Mat::new_rows_cols_with_data(self.height as i32, self.width as i32, self.pixels.as_slice())?;
        let mut lap = core::Mat::default();
        imgproc::laplacian(&*src, &mut lap, core::CV_64F, 1, 1.0, 0.0, core::BORDER_DEFAULT)?;
        let mut mean = core::Vector::<f64>::new();
        let mut stddev = core::Vector::<f64>::new();
        core::mean_std_dev(&lap, &mut mean, &mut stddev, &core::no_array())?;
        let sd = stddev.get(0)?;
        Ok((sd * sd) as f32)
    }

    /// Convert a BGR or single-channel OpenCV image.
    #[cfg(feature = "opencv")]
    pub fn from_mat(mat: &opencv::core::Mat) -> anyhow::Result<Self> {
        use opencv::{imgproc, prelude::*};

        let gray = if mat.channels() == 3 {
            let mut gray = opencv::core::Mat::default();
            imgproc::cvt_color(mat, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
            gray
        } else {
            mat.try_clone()?
        };
        let gray = if gray.is_continuous() { gray } else { gray.try_clone()? };
        let pixels = gray.data_bytes()?.to_vec();
        Ok(FaceCrop::new(gray.cols() as u32, gray.rows() as u32, pixels)?)
    }
}

fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r.clamp(0, n - 1) as usize
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("empty crop")]
    Empty,
    #[error("too dark (brightness {0:.1})")]
    TooDark(f32),
    #[error("too bright (brightness {0:.1})")]
    TooBright(f32),
    #[error("too blurry (laplacian variance {0:.1})")]
    TooBlurry(f32),
    #[error("face too small ({0}px)")]
    TooSmall(u32),
    #[error("invalid face proportions ({0:.2})")]
    BadProportions(f32),
    #[error("face is tilted ({0:.1} deg)")]
    Tilted(f32),
    #[error("face is not frontal (eye ratio {0:.2})")]
    NotFrontal(f32),
    #[error("face is turned sideways (nose offset {0:.2})")]
    TurnedSideways(f32),
    #[error("face is looking up (vertical ratio {0:.2})")]
    LookingUp(f32),
    #[error("face is looking down (vertical ratio {0:.2})")]
    LookingDown(f32),
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    cfg: QualityConfig,
}

impl QualityGate {
    pub fn new(cfg: QualityConfig) -> Self {
        Self { cfg }
    }

    /// Check a crop; on success returns its quality score (brightness / 255).
    pub fn check(
        &self,
        crop: &FaceCrop,
        landmarks: Option<&Landmarks>,
        for_registration: bool,
    ) -> std::result::Result<f32, RejectReason> {
        if crop.is_empty() {
            return Err(RejectReason::Empty);
        }
        let brightness = crop.brightness();
        if brightness < self.cfg.min_brightness {
            return Err(RejectReason::TooDark(brightness));
        }
        if brightness > self.cfg.max_brightness {
            return Err(RejectReason::TooBright(brightness));
        }

        let blur = crop.laplacian_variance();
        if blur < self.cfg.min_laplacian_variance {
            return Err(RejectReason::TooBlurry(blur));
        }

        let min_dim = crop.width().min(crop.height());
        if min_dim < self.cfg.min_face_size {
            return Err(RejectReason::TooSmall(min_dim));
        }

        let aspect = crop.height() as f32 / crop.width() as f32;
        if !(self.cfg.min_aspect_ratio..=self.cfg.max_aspect_ratio).contains(&aspect) {
            return Err(RejectReason::BadProportions(aspect));
        }

        if for_registration {
            if let Some(lm) = landmarks {
                self.check_pose(lm, crop.width() as f32)?;
            }
        }

        Ok(brightness / 255.0)
    }

    /// Frontal-pose checks from landmark geometry.
    pub fn check_pose(&self, lm: &Landmarks, face_width: f32) -> std::result::Result<(), RejectReason> {
        let eye_delta = lm.right_eye - lm.left_eye;
        let eye_angle = eye_delta.y.atan2(eye_delta.x).to_degrees();
        if eye_angle.abs() > self.cfg.max_eye_angle_deg {
            return Err(RejectReason::Tilted(eye_angle));
        }

        let eye_ratio = eye_delta.norm() / face_width;
        if eye_ratio < self.cfg.min_eye_distance_ratio {
            return Err(RejectReason::NotFrontal(eye_ratio));
        }

        let eye_center_x = (lm.left_eye.x + lm.right_eye.x) / 2.0;
        let nose_offset = (lm.nose.x - eye_center_x).abs() / face_width;
        if nose_offset > self.cfg.max_nose_offset_ratio {
            return Err(RejectReason::TurnedSideways(nose_offset));
        }

        let eye_level = (lm.left_eye.y + lm.right_eye.y) / 2.0;
        let mouth_level = (lm.left_mouth.y + lm.right_mouth.y) / 2.0;
        let nose_to_eye = lm.nose.y - eye_level;
        let nose_to_mouth = mouth_level - lm.nose.y;
        let vertical = if nose_to_mouth != 0.0 { nose_to_eye / nose_to_mouth } else { f32::INFINITY };
        if vertical < self.cfg.min_vertical_ratio {
            return Err(RejectReason::LookingUp(vertical));
        }
        if vertical > self.cfg.max_vertical_ratio {
            return Err(RejectReason::LookingDown(vertical));
        }
        Ok(())
    }
}
