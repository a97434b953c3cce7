//! OpenCV compatibility wrappers for cross-version support.
//!
//! Different OpenCV versions have different function signatures due to added parameters:
//! - OpenCV 4.11+ added `AlgorithmHint` to `cvt_color`, `gaussian_blur`, etc.
//! - OpenCV 4.8+ added `enable_precise_upscale` to `SIFT::create`
//! - OpenCV 4.7+ added `max_points` to `AKAZE::create`
//!
//! The opencv Rust crate generates different function signatures depending on which
//! OpenCV headers are installed, so every call site that would otherwise pin a version
//! goes through the `_def` variants wrapped here.

use opencv::core::{ToInputArray, ToOutputArray};
use opencv::prelude::*;
use opencv::{core, features2d, imgproc, Result};

/// Wrapper for `imgproc::cvt_color` that works across OpenCV versions.
/// `cvt_color_def` applies `dst_cn=0` and the default `AlgorithmHint` on 4.11+.
pub fn cvt_color(
    src: &impl ToInputArray,
    dst: &mut impl ToOutputArray,
    code: i32,
) -> Result<()> {
    imgproc::cvt_color_def(src, dst, code)
}

/// Convert any 1/3/4 channel 8-bit image to a single-channel grayscale `Mat`.
pub fn to_grayscale(img: &Mat) -> Result<Mat> {
    let mut gray = Mat::default();
    match img.channels() {
        3 => cvt_color(img, &mut gray, imgproc::COLOR_BGR2GRAY)?,
        4 => cvt_color(img, &mut gray, imgproc::COLOR_BGRA2GRAY)?,
        _ => gray = img.clone(),
    }
    Ok(gray)
}

/// ORB tuned for panoramas: many features, Harris scoring, sensitive FAST threshold.
pub fn orb_create() -> Result<core::Ptr<features2d::ORB>> {
    features2d::ORB::create(
        3000, // nfeatures
        1.2,  // scaleFactor
        8,    // nlevels
        15,   // edgeThreshold
        0,    // firstLevel
        2,    // WTA_K
        features2d::ORB_ScoreType::HARRIS_SCORE,
        31, // patchSize
        10, // fastThreshold
    )
}

/// Wrapper for `features2d::SIFT::create` that works across OpenCV versions.
/// OpenCV 4.8+ added `enable_precise_upscale` as a 6th parameter, so only the
/// defaults are used: nfeatures=0 (unlimited), nOctaveLayers=3,
/// contrastThreshold=0.04, edgeThreshold=10, sigma=1.6.
pub fn sift_create() -> Result<core::Ptr<features2d::SIFT>> {
    features2d::SIFT::create_def()
}

/// Wrapper for `features2d::AKAZE::create` that works across OpenCV versions.
/// OpenCV 4.7+ added `max_points` as an 8th parameter.
pub fn akaze_create() -> Result<core::Ptr<features2d::AKAZE>> {
    features2d::AKAZE::create_def()
}

/// Exact projective transform through four point pairs (`solveMethod=DECOMP_LU`).
pub fn perspective_transform_4pt(
    src: &impl ToInputArray,
    dst: &impl ToInputArray,
) -> Result<Mat> {
    imgproc::get_perspective_transform_def(src, dst)
}
