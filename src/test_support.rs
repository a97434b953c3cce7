//! Synthetic scenes shared by the unit tests.

use opencv::core::{self, Mat, Rect};
use opencv::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A wide BGR scene covered in overlapping random rectangles, rich in corners.
pub fn textured_scene(width: i32, height: i32, seed: u64) -> Mat {
    let (w, h) = (width as usize, height as usize);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut buf = vec![0u8; w * h * 3];

    for px in buf.chunks_mut(3) {
        let v = rng.gen_range(100..140u8);
        px.copy_from_slice(&[v, v, v]);
    }

    let rects = (w * h) / 120;
    for _ in 0..rects {
        let rw = rng.gen_range(3..24usize);
        let rh = rng.gen_range(3..24usize);
        let x0 = rng.gen_range(0..w);
        let y0 = rng.gen_range(0..h);
        let color = [rng.gen::<u8>(), rng.gen::<u8>(), rng.gen::<u8>()];
        for y in y0..(y0 + rh).min(h) {
            for x in x0..(x0 + rw).min(w) {
                let i = (y * w + x) * 3;
                buf[i..i + 3].copy_from_slice(&color);
            }
        }
    }

    let mut mat =
        Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, core::Scalar::all(0.0))
            .unwrap();
    mat.data_bytes_mut().unwrap().copy_from_slice(&buf);
    mat
}

/// Owned copy of a rectangular window of `scene`.
pub fn crop(scene: &Mat, x: i32, y: i32, width: i32, height: i32) -> Mat {
    let roi = Mat::roi(scene, Rect::new(x, y, width, height)).unwrap();
    let mut out = Mat::default();
    roi.copy_to(&mut out).unwrap();
    out
}

/// A featureless BGR image of one gray level.
pub fn flat(width: i32, height: i32, value: f64) -> Mat {
    Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, core::Scalar::all(value))
        .unwrap()
}

/// Three 200x200 views where each view's content sits 50px further right
/// than in the view before it.
pub fn shifted_views() -> Vec<Mat> {
    views_at(300, 7, &[100, 50, 0])
}

/// 200x200 crops of one scene, the i-th view starting at column `offsets[i]`.
pub fn views_at(scene_width: i32, seed: u64, offsets: &[i32]) -> Vec<Mat> {
    let scene = textured_scene(scene_width, 200, seed);
    offsets
        .iter()
        .map(|&x| crop(&scene, x, 0, 200, 200))
        .collect()
}
