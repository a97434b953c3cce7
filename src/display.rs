use opencv::core::{self, Mat};
use opencv::prelude::*;
use opencv::{highgui, imgproc};
use serde::{Deserialize, Serialize};

use crate::error::StitchResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    /// Pixel budget of the preview window; large panoramas are shrunk
    /// uniformly to fit it.
    pub max_pixels: f64,
    /// Milliseconds to wait on each intermediate preview (0 waits for a key).
    pub frame_delay_ms: i32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pixels: 500_000.0,
            frame_delay_ms: 25,
        }
    }
}

/// Preview dimensions for a `width` x `height` image under `max_pixels`.
/// Images already within budget keep their size.
pub fn preview_size(width: i32, height: i32, max_pixels: f64) -> (i32, i32) {
    let area = (width as f64 * height as f64).max(1.0);
    let scale = (max_pixels / area).min(1.0).sqrt();
    (
        ((scale * width as f64) as i32).max(1),
        ((scale * height as f64) as i32).max(1),
    )
}

/// Show `img` in a window named `title`, shrunk to the pixel budget.
pub fn show(title: &str, img: &Mat, max_pixels: f64) -> StitchResult<()> {
    let (w, h) = preview_size(img.cols(), img.rows(), max_pixels);
    let mut small = Mat::default();
    imgproc::resize(
        img,
        &mut small,
        core::Size::new(w, h),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    highgui::imshow(title, &small)?;
    Ok(())
}

/// Pump the window event loop; true when the user pressed `q` or Esc.
pub fn wait(delay_ms: i32) -> StitchResult<bool> {
    let key = highgui::wait_key(delay_ms)?;
    Ok(key == 'q' as i32 || key == 27)
}

pub fn close_all() -> StitchResult<()> {
    highgui::destroy_all_windows()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_images_keep_their_size() {
        assert_eq!(preview_size(400, 300, 500_000.0), (400, 300));
    }

    #[test]
    fn test_large_images_fit_the_budget() {
        let (w, h) = preview_size(4000, 1000, 500_000.0);
        assert!((w * h) as f64 <= 500_000.0);
        // aspect ratio is preserved
        assert!(((w as f64 / h as f64) - 4.0).abs() < 0.01);
        assert_eq!((w, h), (1414, 353));
    }
}
