//! The growing mosaic buffer.
//!
//! Every composited image is warped into the previous image's frame and
//! appended to the right of everything absorbed so far. The canvas only
//! grows: width by exactly one warped buffer per image, height never shrinks.

use opencv::core::{self, Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{StitchError, StitchResult};
use crate::homography::Homography;

/// Size of the buffer each new image is warped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum WarpExtent {
    /// The current canvas size; the canvas doubles in width at every step.
    Canvas,
    /// The source image's width, and the taller of canvas and source height.
    Source,
}

impl WarpExtent {
    pub fn target_size(&self, canvas: Size, source: Size) -> Size {
        match self {
            WarpExtent::Canvas => canvas,
            WarpExtent::Source => Size::new(source.width, source.height.max(canvas.height)),
        }
    }
}

impl std::fmt::Display for WarpExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarpExtent::Canvas => write!(f, "canvas"),
            WarpExtent::Source => write!(f, "source"),
        }
    }
}

/// Reproject `img` through `h` into a `size` buffer. Pixels landing outside
/// the buffer are dropped; uncovered pixels stay black.
pub fn warp_into_frame(img: &Mat, h: &Homography, size: Size) -> StitchResult<Mat> {
    let mut warped = Mat::default();
    imgproc::warp_perspective(
        img,
        &mut warped,
        &h.to_mat()?,
        size,
        imgproc::INTER_LINEAR,
        core::BORDER_CONSTANT,
        core::Scalar::all(0.0),
    )?;
    Ok(warped)
}

#[derive(Debug, Clone)]
pub struct Canvas {
    mat: Mat,
}

impl Canvas {
    pub fn new(first: Mat) -> StitchResult<Self> {
        if first.empty() {
            return Err(StitchError::IncompatibleImage(
                "initial canvas image is empty".to_string(),
            ));
        }
        Ok(Self { mat: first })
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }

    pub fn as_mat(&self) -> &Mat {
        &self.mat
    }

    pub fn into_mat(self) -> Mat {
        self.mat
    }

    /// Grow the canvas downward with black rows until it is `height` tall.
    /// Never shrinks.
    pub fn pad_to_height(&mut self, height: i32) -> StitchResult<()> {
        let extra = height - self.height();
        if extra <= 0 {
            return Ok(());
        }
        let mut padded = Mat::default();
        core::copy_make_border(
            &self.mat,
            &mut padded,
            0,
            extra,
            0,
            0,
            core::BORDER_CONSTANT,
            core::Scalar::all(0.0),
        )?;
        log::debug!("Canvas padded from {} to {} rows", self.height(), height);
        self.mat = padded;
        Ok(())
    }

    /// Place `warped` immediately to the right of the current content.
    pub fn append(mut self, warped: &Mat) -> StitchResult<Canvas> {
        if warped.typ() != self.mat.typ() {
            return Err(StitchError::IncompatibleImage(format!(
                "warped buffer type {} does not match canvas type {}",
                warped.typ(),
                self.mat.typ()
            )));
        }
        if warped.rows() < self.height() {
            return Err(StitchError::IncompatibleImage(format!(
                "warped buffer is {} rows, canvas is {} rows",
                warped.rows(),
                self.height()
            )));
        }

        self.pad_to_height(warped.rows())?;

        let mut joined = Mat::default();
        core::hconcat2(&self.mat, warped, &mut joined)?;
        Ok(Canvas { mat: joined })
    }

    /// Warp `img` by `h` and append it. Returns the grown canvas and the
    /// width that was added.
    pub fn composite(
        self,
        img: &Mat,
        h: &Homography,
        extent: WarpExtent,
    ) -> StitchResult<(Canvas, i32)> {
        let target = extent.target_size(self.size(), Size::new(img.cols(), img.rows()));
        let warped = warp_into_frame(img, h, target)?;
        let added = warped.cols();
        let canvas = self.append(&warped)?;
        Ok((canvas, added))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{flat, textured_scene};

    #[test]
    fn test_canvas_extent_doubles_width() {
        let canvas = Canvas::new(flat(100, 80, 50.0)).unwrap();
        let (canvas, added) = canvas
            .composite(&flat(100, 80, 200.0), &Homography::identity(), WarpExtent::Canvas)
            .unwrap();
        assert_eq!(added, 100);
        assert_eq!((canvas.width(), canvas.height()), (200, 80));

        let (canvas, added) = canvas
            .composite(&flat(100, 80, 200.0), &Homography::identity(), WarpExtent::Canvas)
            .unwrap();
        assert_eq!(added, 200);
        assert_eq!((canvas.width(), canvas.height()), (400, 80));
    }

    #[test]
    fn test_source_extent_adds_source_width() {
        let canvas = Canvas::new(flat(100, 80, 50.0)).unwrap();
        let (canvas, added) = canvas
            .composite(&flat(60, 80, 200.0), &Homography::identity(), WarpExtent::Source)
            .unwrap();
        assert_eq!(added, 60);
        assert_eq!((canvas.width(), canvas.height()), (160, 80));
    }

    #[test]
    fn test_taller_source_pads_canvas_downward() {
        let canvas = Canvas::new(flat(100, 80, 50.0)).unwrap();
        let (canvas, _) = canvas
            .composite(&flat(60, 120, 200.0), &Homography::identity(), WarpExtent::Source)
            .unwrap();
        assert_eq!((canvas.width(), canvas.height()), (160, 120));
        let mat = canvas.as_mat();
        // original content kept, padding black, warped content to the right
        assert_eq!(mat.at_2d::<core::Vec3b>(10, 10).unwrap()[0], 50);
        assert_eq!(mat.at_2d::<core::Vec3b>(110, 10).unwrap()[0], 0);
        assert_eq!(mat.at_2d::<core::Vec3b>(110, 130).unwrap()[0], 200);
    }

    #[test]
    fn test_pad_never_shrinks() {
        let mut canvas = Canvas::new(flat(10, 40, 1.0)).unwrap();
        canvas.pad_to_height(20).unwrap();
        assert_eq!(canvas.height(), 40);
        canvas.pad_to_height(45).unwrap();
        assert_eq!(canvas.height(), 45);
    }

    #[test]
    fn test_out_of_frame_pixels_are_black() {
        let img = textured_scene(100, 100, 2);
        let warped =
            warp_into_frame(&img, &Homography::translation(-60.0, 0.0), Size::new(100, 100))
                .unwrap();
        assert_eq!(*warped.at_2d::<core::Vec3b>(50, 70).unwrap(), core::Vec3b::all(0));
        assert_eq!(
            *warped.at_2d::<core::Vec3b>(50, 10).unwrap(),
            *img.at_2d::<core::Vec3b>(50, 70).unwrap()
        );
    }

    #[test]
    fn test_mismatched_types_are_rejected() {
        let canvas = Canvas::new(flat(10, 10, 1.0)).unwrap();
        let gray =
            Mat::new_rows_cols_with_default(10, 10, core::CV_8UC1, core::Scalar::all(0.0)).unwrap();
        assert!(matches!(
            canvas.append(&gray),
            Err(StitchError::IncompatibleImage(_))
        ));
    }

    #[test]
    fn test_empty_initial_image_is_rejected() {
        assert!(Canvas::new(Mat::default()).is_err());
    }
}
