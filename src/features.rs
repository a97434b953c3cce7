use opencv::core::{self, KeyPoint, Mat, Point2f};
use opencv::prelude::*;
use opencv::imgproc;
use serde::{Deserialize, Serialize};

use crate::error::StitchResult;
use crate::opencv_compat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum FeatureDetector {
    ORB,
    SIFT,
    AKAZE,
}

impl FeatureDetector {
    /// Distance norm matching the descriptor family: binary descriptors
    /// compare by Hamming distance, SIFT by L2.
    pub fn norm_type(&self) -> i32 {
        match self {
            FeatureDetector::ORB => core::NORM_HAMMING,
            FeatureDetector::SIFT => core::NORM_L2,
            FeatureDetector::AKAZE => core::NORM_HAMMING,
        }
    }
}

impl std::fmt::Display for FeatureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureDetector::ORB => write!(f, "ORB (Fast)"),
            FeatureDetector::SIFT => write!(f, "SIFT (Best Quality)"),
            FeatureDetector::AKAZE => write!(f, "AKAZE (Balanced)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub detector: FeatureDetector,
    /// Contrast-limited histogram equalization before detection; helps with
    /// dark or hazy frames.
    pub use_clahe: bool,
    /// Detection runs on a copy scaled by this factor (0 < s <= 1); keypoints
    /// are mapped back to full-resolution coordinates.
    pub detection_scale: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            detector: FeatureDetector::SIFT,
            use_clahe: false,
            detection_scale: 1.0,
        }
    }
}

/// Keypoints of one image and their descriptors; row `i` of `descriptors`
/// belongs to `keypoints[i]`.
#[derive(Debug, Clone)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Mat,
}

impl Features {
    pub fn empty() -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Mat::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty() || self.descriptors.empty()
    }

    pub fn point(&self, idx: usize) -> Point2f {
        self.keypoints[idx].pt()
    }
}

/// Extract features from an image using the configured detector.
///
/// Colour input is converted to grayscale first. An image without usable
/// texture produces empty `Features`, not an error.
pub fn extract_features(img: &Mat, config: &FeatureConfig) -> StitchResult<Features> {
    let gray = opencv_compat::to_grayscale(img)?;

    let preprocessed = if config.use_clahe {
        let mut clahe = imgproc::create_clahe(2.0, core::Size::new(8, 8))?;
        let mut enhanced = Mat::default();
        clahe.apply(&gray, &mut enhanced)?;
        enhanced
    } else {
        gray
    };

    let scale = config.detection_scale.clamp(0.05, 1.0);
    let detection_img = if scale < 1.0 {
        let mut small = Mat::default();
        imgproc::resize(
            &preprocessed,
            &mut small,
            core::Size::default(),
            scale,
            scale,
            imgproc::INTER_AREA,
        )?;
        small
    } else {
        preprocessed
    };

    let mut keypoints = core::Vector::<KeyPoint>::new();
    let mut descriptors = Mat::default();
    let mask = Mat::default();

    match config.detector {
        FeatureDetector::ORB => {
            let mut orb = opencv_compat::orb_create()?;
            orb.detect_and_compute(&detection_img, &mask, &mut keypoints, &mut descriptors, false)?;
        }
        FeatureDetector::SIFT => {
            let mut sift = opencv_compat::sift_create()?;
            sift.detect_and_compute(&detection_img, &mask, &mut keypoints, &mut descriptors, false)?;
        }
        FeatureDetector::AKAZE => {
            let mut akaze = opencv_compat::akaze_create()?;
            akaze.detect_and_compute(&detection_img, &mask, &mut keypoints, &mut descriptors, false)?;
        }
    }

    let mut keypoints = keypoints.to_vec();
    if scale < 1.0 {
        for kp in keypoints.iter_mut() {
            let pt = kp.pt();
            kp.set_pt(Point2f::new(pt.x / scale as f32, pt.y / scale as f32));
            kp.set_size(kp.size() / scale as f32);
        }
    }

    log::debug!(
        "{} found {} keypoints on {}x{} image",
        config.detector,
        keypoints.len(),
        img.cols(),
        img.rows()
    );

    if keypoints.is_empty() {
        return Ok(Features::empty());
    }

    Ok(Features {
        keypoints,
        descriptors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{flat, textured_scene};

    fn orb() -> FeatureConfig {
        FeatureConfig {
            detector: FeatureDetector::ORB,
            ..Default::default()
        }
    }

    #[test]
    fn test_textured_image_yields_parallel_keypoints_and_descriptors() {
        let img = textured_scene(200, 200, 1);
        let features = extract_features(&img, &orb()).unwrap();
        assert!(features.len() > 50, "only {} keypoints", features.len());
        assert_eq!(features.descriptors.rows() as usize, features.len());
    }

    #[test]
    fn test_flat_image_yields_no_features() {
        let img = flat(160, 120, 128.0);
        let features = extract_features(&img, &orb()).unwrap();
        assert!(features.is_empty());
        assert_eq!(features.len(), 0);
    }

    #[test]
    fn test_downscaled_detection_maps_back_to_full_resolution() {
        let img = textured_scene(240, 200, 3);
        let config = FeatureConfig {
            detection_scale: 0.5,
            ..orb()
        };
        let features = extract_features(&img, &config).unwrap();
        assert!(!features.is_empty());
        let max_x = features
            .keypoints
            .iter()
            .map(|kp| kp.pt().x)
            .fold(0.0f32, f32::max);
        // coordinates span the full-size image, not the half-size copy
        assert!(max_x > 130.0, "max x = {}", max_x);
        assert!(max_x < 240.0);
    }

    #[test]
    fn test_norm_type_matches_descriptor_family() {
        assert_eq!(FeatureDetector::ORB.norm_type(), core::NORM_HAMMING);
        assert_eq!(FeatureDetector::AKAZE.norm_type(), core::NORM_HAMMING);
        assert_eq!(FeatureDetector::SIFT.norm_type(), core::NORM_L2);
    }
}
