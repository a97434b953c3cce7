//! Frame-quality gate applied while pulling frames out of a video.

use opencv::core::{self, Mat};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::StitchResult;
use crate::opencv_compat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFilterConfig {
    /// Keep every n-th decoded frame (1 keeps all).
    pub frame_step: usize,
    /// Minimum variance-of-Laplacian score; `None` disables the blur check.
    pub min_sharpness: Option<f64>,
}

impl Default for FrameFilterConfig {
    fn default() -> Self {
        Self {
            frame_step: 1,
            min_sharpness: None,
        }
    }
}

impl FrameFilterConfig {
    pub fn wants_index(&self, index: usize) -> bool {
        index % self.frame_step.max(1) == 0
    }

    pub fn accepts(&self, index: usize, sharpness: Option<f64>) -> bool {
        if !self.wants_index(index) {
            return false;
        }
        match (self.min_sharpness, sharpness) {
            (Some(min), Some(score)) => score >= min,
            _ => true,
        }
    }
}

/// Variance of the Laplacian of the grayscale image: 0 for a flat frame,
/// larger for sharper detail.
pub fn compute_sharpness(img: &Mat) -> StitchResult<f64> {
    let gray = opencv_compat::to_grayscale(img)?;

    let mut laplacian = Mat::default();
    imgproc::laplacian(
        &gray,
        &mut laplacian,
        core::CV_64F,
        3,
        1.0,
        0.0,
        core::BORDER_DEFAULT,
    )?;

    let mut mean = Mat::default();
    let mut stddev = Mat::default();
    core::mean_std_dev(&laplacian, &mut mean, &mut stddev, &Mat::default())?;
    let sd = *stddev.at_2d::<f64>(0, 0)?;
    Ok(sd * sd)
}
