use opencv::core::{self, Mat, Rect};
use opencv::imgproc;
use opencv::prelude::*;

use crate::error::StitchResult;
use crate::opencv_compat;

/// Bounding box of all non-black pixels, `None` for an all-black image.
pub fn content_bounds(img: &Mat) -> StitchResult<Option<Rect>> {
    let gray = opencv_compat::to_grayscale(img)?;
    if core::count_non_zero(&gray)? == 0 {
        return Ok(None);
    }
    let mut coords = Mat::default();
    core::find_non_zero(&gray, &mut coords)?;
    Ok(Some(imgproc::bounding_rect(&coords)?))
}

/// Trim the black margins that warping leaves around the mosaic.
pub fn crop_to_content(img: Mat) -> StitchResult<Mat> {
    let rect = match content_bounds(&img)? {
        Some(rect) if rect.width != img.cols() || rect.height != img.rows() => rect,
        _ => return Ok(img),
    };
    log::info!(
        "Cropping {}x{} panorama to {}x{} at ({}, {})",
        img.cols(),
        img.rows(),
        rect.width,
        rect.height,
        rect.x,
        rect.y
    );
    let roi = Mat::roi(&img, rect)?;
    let mut cropped = Mat::default();
    roi.copy_to(&mut cropped)?;
    Ok(cropped)
}

/// Stretch intensities linearly so the darkest value maps to 0 and the
/// brightest to 255.
pub fn normalize_range(img: Mat) -> StitchResult<Mat> {
    let mut normalized = Mat::default();
    core::normalize(
        &img,
        &mut normalized,
        0.0,
        255.0,
        core::NORM_MINMAX,
        -1,
        &Mat::default(),
    )?;
    Ok(normalized)
}

/// Optional finishing steps applied to a panorama before it is saved:
/// crop first, then normalize.
pub fn finalize(img: Mat, crop: bool, normalize: bool) -> StitchResult<Mat> {
    let img = if crop { crop_to_content(img)? } else { img };
    if normalize {
        normalize_range(img)
    } else {
        Ok(img)
    }
}
