//! Robust projective alignment between two images.
//!
//! RANSAC draws its minimal samples from a caller-supplied random generator,
//! so a seeded generator makes estimation reproducible.

use opencv::calib3d;
use opencv::core::{self, Mat, Point2f};
use opencv::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{StitchError, StitchResult};
use crate::opencv_compat;

const MIN_SAMPLE: usize = 4;

/// A 3x3 projective transform, row-major, normalized so that `h[2][2] == 1`
/// whenever that entry is non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    pub m: [[f64; 3]; 3],
}

impl Homography {
    pub fn new(m: [[f64; 3]; 3]) -> Self {
        let s = m[2][2];
        if s.abs() > 1e-12 {
            let mut n = m;
            n.iter_mut().flatten().for_each(|v| *v /= s);
            Self { m: n }
        } else {
            Self { m }
        }
    }

    /// Map a point; `None` when it lands on the line at infinity.
    pub fn project(&self, p: Point2f) -> Option<Point2f> {
        let (x, y) = (p.x as f64, p.y as f64);
        let m = &self.m;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w.abs() < 1e-12 {
            return None;
        }
        let u = (m[0][0] * x + m[0][1] * y + m[0][2]) / w;
        let v = (m[1][0] * x + m[1][1] * y + m[1][2]) / w;
        Some(Point2f::new(u as f32, v as f32))
    }

    /// Distance between `H * b` and `a`, infinite when `b` maps to infinity.
    pub fn reprojection_error(&self, a: Point2f, b: Point2f) -> f64 {
        match self.project(b) {
            Some(p) => (((p.x - a.x) as f64).powi(2) + ((p.y - a.y) as f64).powi(2)).sqrt(),
            None => f64::INFINITY,
        }
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.m;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Singular, non-finite, or orientation-flipping transforms cannot come
    /// from two views of the same scene.
    pub fn is_degenerate(&self) -> bool {
        if !self.m.iter().flatten().all(|v| v.is_finite()) {
            return true;
        }
        let det = self.determinant();
        det.abs() < 1e-6 || det < 0.0
    }

    pub fn to_mat(&self) -> StitchResult<Mat> {
        Ok(Mat::from_slice_2d(&self.m)?)
    }

    pub fn from_mat(mat: &Mat) -> StitchResult<Self> {
        if mat.rows() != 3 || mat.cols() != 3 {
            return Err(StitchError::InvalidParams(format!(
                "homography must be 3x3, got {}x{}",
                mat.rows(),
                mat.cols()
            )));
        }
        let mut h64 = Mat::default();
        mat.convert_to(&mut h64, core::CV_64F, 1.0, 0.0)?;
        let mut m = [[0.0; 3]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = *h64.at_2d::<f64>(r as i32, c as i32)?;
            }
        }
        Ok(Self::new(m))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Maximum reprojection error (pixels) for a correspondence to count as an inlier.
    pub reproj_threshold: f64,
    pub max_iterations: usize,
    /// Desired probability that at least one sample was outlier-free; drives
    /// early termination.
    pub confidence: f64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            reproj_threshold: 5.0,
            max_iterations: 2000,
            confidence: 0.995,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Estimate {
    pub homography: Homography,
    /// `inliers[i]` is true when correspondence `i` agrees with `homography`.
    pub inliers: Vec<bool>,
    pub inlier_count: usize,
    pub iterations: usize,
}

/// Fit the homography mapping `points_b` onto `points_a`.
pub fn estimate_homography<R: Rng + ?Sized>(
    points_a: &[Point2f],
    points_b: &[Point2f],
    params: &RansacParams,
    rng: &mut R,
) -> StitchResult<Estimate> {
    if points_a.len() != points_b.len() {
        return Err(StitchError::InvalidParams(format!(
            "point lists differ in length ({} vs {})",
            points_a.len(),
            points_b.len()
        )));
    }
    let n = points_a.len();
    if n < MIN_SAMPLE {
        return Err(StitchError::InsufficientCorrespondences { found: n });
    }

    let mut best: Option<(Homography, Vec<bool>, usize)> = None;
    let mut max_iters = params.max_iterations;
    let mut iter = 0;

    while iter < max_iters {
        iter += 1;

        let sample = rand::seq::index::sample(rng, n, MIN_SAMPLE);
        let sa: Vec<Point2f> = sample.iter().map(|i| points_a[i]).collect();
        let sb: Vec<Point2f> = sample.iter().map(|i| points_b[i]).collect();
        if has_collinear_triplet(&sa) || has_collinear_triplet(&sb) {
            continue;
        }

        let candidate = match fit_minimal(&sa, &sb) {
            Ok(Some(h)) => h,
            _ => continue,
        };

        let (mask, count) = score(&candidate, points_a, points_b, params.reproj_threshold);
        if best.as_ref().map_or(true, |(_, _, c)| count > *c) {
            max_iters = update_iterations(count, n, params.confidence, max_iters);
            best = Some((candidate, mask, count));
        }
    }

    let (candidate, mask, count) = match best {
        Some(b) if b.2 >= MIN_SAMPLE => b,
        other => {
            let inliers = other.map_or(0, |b| b.2);
            log::debug!("RANSAC gave up after {} iterations ({} inliers)", iter, inliers);
            return Err(StitchError::NoConsensus { inliers });
        }
    };

    // least-squares refit on the consensus set only
    let (homography, inliers, inlier_count) = match refit(points_a, points_b, &mask)? {
        Some(refined) => {
            let (refined_mask, refined_count) =
                score(&refined, points_a, points_b, params.reproj_threshold);
            if refined_count >= count {
                (refined, refined_mask, refined_count)
            } else {
                (candidate, mask, count)
            }
        }
        None => (candidate, mask, count),
    };

    log::debug!(
        "RANSAC: {}/{} inliers after {} iterations",
        inlier_count,
        n,
        iter
    );

    Ok(Estimate {
        homography,
        inliers,
        inlier_count,
        iterations: iter,
    })
}

fn to_vector(points: &[Point2f]) -> core::Vector<Point2f> {
    points.iter().copied().collect()
}

fn fit_minimal(sa: &[Point2f], sb: &[Point2f]) -> StitchResult<Option<Homography>> {
    let h = opencv_compat::perspective_transform_4pt(&to_vector(sb), &to_vector(sa))?;
    let h = Homography::from_mat(&h)?;
    Ok((!h.is_degenerate()).then_some(h))
}

fn refit(
    points_a: &[Point2f],
    points_b: &[Point2f],
    mask: &[bool],
) -> StitchResult<Option<Homography>> {
    let (inl_a, inl_b): (Vec<Point2f>, Vec<Point2f>) = points_a
        .iter()
        .zip(points_b)
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|((a, b), _)| (*a, *b))
        .unzip();

    let mut unused_mask = Mat::default();
    // method 0: plain least squares over every supplied point
    let h = calib3d::find_homography(&to_vector(&inl_b), &to_vector(&inl_a), &mut unused_mask, 0, 3.0)?;
    if h.empty() {
        return Ok(None);
    }
    let h = Homography::from_mat(&h)?;
    Ok((!h.is_degenerate()).then_some(h))
}

fn score(h: &Homography, points_a: &[Point2f], points_b: &[Point2f], threshold: f64) -> (Vec<bool>, usize) {
    let mask: Vec<bool> = points_a
        .iter()
        .zip(points_b)
        .map(|(a, b)| h.reprojection_error(*a, *b) <= threshold)
        .collect();
    let count = mask.iter().filter(|m| **m).count();
    (mask, count)
}

fn has_collinear_triplet(pts: &[Point2f]) -> bool {
    for i in 0..pts.len() {
        for j in (i + 1)..pts.len() {
            for k in (j + 1)..pts.len() {
                let (a, b, c) = (pts[i], pts[j], pts[k]);
                let cross = ((b.x - a.x) as f64) * ((c.y - a.y) as f64)
                    - ((b.y - a.y) as f64) * ((c.x - a.x) as f64);
                if cross.abs() < 1e-3 {
                    return true;
                }
            }
        }
    }
    false
}

/// Iterations needed so that, with `confidence`, at least one all-inlier
/// sample has been drawn given the current inlier ratio.
fn update_iterations(inliers: usize, total: usize, confidence: f64, max_iters: usize) -> usize {
    let inlier_ratio = inliers as f64 / total as f64;
    let num = (1.0 - confidence).max(f64::MIN_POSITIVE);
    let denom = 1.0 - inlier_ratio.powi(MIN_SAMPLE as i32);
    if denom < f64::MIN_POSITIVE {
        return 0;
    }
    let (num, denom) = (num.ln(), denom.ln());
    if denom >= 0.0 || -num >= max_iters as f64 * -denom {
        max_iters
    } else {
        (num / denom).round() as usize
    }
}

#[cfg(test)]
impl Homography {
    pub fn identity() -> Self {
        Self::new([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    pub fn translation(tx: f64, ty: f64) -> Self {
        Self::new([[1.0, 0.0, tx], [0.0, 1.0, ty], [0.0, 0.0, 1.0]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn known_transform() -> Homography {
        Homography::new([
            [0.98, -0.05, 40.0],
            [0.04, 1.01, -12.0],
            [0.0001, -0.00005, 1.0],
        ])
    }

    /// 100 noisy inliers under `known_transform` followed by 30 random outliers.
    fn synthetic_pairs(seed: u64) -> (Vec<Point2f>, Vec<Point2f>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let h = known_transform();
        let mut a = Vec::new();
        let mut b = Vec::new();
        for _ in 0..100 {
            let pb = Point2f::new(rng.gen_range(0.0..400.0), rng.gen_range(0.0..300.0));
            let pa = h.project(pb).unwrap();
            a.push(Point2f::new(
                pa.x + rng.gen_range(-0.5..0.5),
                pa.y + rng.gen_range(-0.5..0.5),
            ));
            b.push(pb);
        }
        for _ in 0..30 {
            a.push(Point2f::new(rng.gen_range(0.0..400.0), rng.gen_range(0.0..300.0)));
            b.push(Point2f::new(rng.gen_range(0.0..400.0), rng.gen_range(0.0..300.0)));
        }
        (a, b)
    }

    #[test]
    fn test_recovers_known_transform_despite_outliers() {
        let (a, b) = synthetic_pairs(11);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let est = estimate_homography(&a, &b, &RansacParams::default(), &mut rng).unwrap();

        let within = (0..100)
            .filter(|&i| est.homography.reprojection_error(a[i], b[i]) < 5.0)
            .count();
        assert!(within >= 95, "only {} of 100 true inliers reproject", within);
        assert!(est.inlier_count >= 95);
        // outliers are excluded from the consensus set almost entirely
        let outliers_kept = est.inliers[100..].iter().filter(|m| **m).count();
        assert!(outliers_kept <= 3, "{} outliers kept", outliers_kept);
    }

    #[test]
    fn test_same_seed_same_result() {
        let (a, b) = synthetic_pairs(5);
        let params = RansacParams::default();
        let first = estimate_homography(&a, &b, &params, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        let second = estimate_homography(&a, &b, &params, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        assert_eq!(first.homography, second.homography);
        assert_eq!(first.inliers, second.inliers);
    }

    #[test]
    fn test_fewer_than_four_correspondences_fail() {
        let a = vec![Point2f::new(0.0, 0.0), Point2f::new(1.0, 0.0), Point2f::new(0.0, 1.0)];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = estimate_homography(&a, &a, &RansacParams::default(), &mut rng).unwrap_err();
        assert!(matches!(err, StitchError::InsufficientCorrespondences { found: 3 }));
    }

    #[test]
    fn test_collinear_points_have_no_consensus() {
        let a: Vec<Point2f> = (0..20).map(|i| Point2f::new(i as f32 * 5.0, 10.0)).collect();
        let params = RansacParams {
            max_iterations: 50,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = estimate_homography(&a, &a, &params, &mut rng).unwrap_err();
        assert!(matches!(err, StitchError::NoConsensus { .. }));
    }

    #[test]
    fn test_pure_translation_is_exact() {
        let b: Vec<Point2f> = (0..12)
            .map(|i| Point2f::new((i * 17 % 100) as f32, (i * 31 % 90) as f32))
            .collect();
        let a: Vec<Point2f> = b.iter().map(|p| Point2f::new(p.x - 50.0, p.y)).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let est = estimate_homography(&a, &b, &RansacParams::default(), &mut rng).unwrap();
        assert_eq!(est.inlier_count, 12);
        let p = est.homography.project(Point2f::new(100.0, 20.0)).unwrap();
        assert!((p.x - 50.0).abs() < 0.01 && (p.y - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_mat_round_trip_normalizes_scale() {
        let h = Homography::new([[2.0, 0.0, 4.0], [0.0, 2.0, 6.0], [0.0, 0.0, 2.0]]);
        assert_eq!(h, Homography::translation(2.0, 3.0));
        let back = Homography::from_mat(&h.to_mat().unwrap()).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_degenerate_transforms_are_flagged() {
        assert!(!Homography::identity().is_degenerate());
        assert!(Homography::new([[0.0; 3], [0.0; 3], [0.0, 0.0, 1.0]]).is_degenerate());
        assert!(Homography::new([[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).is_degenerate());
    }

    #[test]
    fn test_error_at_threshold_counts_as_inlier() {
        let h = Homography::identity();
        let a = [Point2f::new(5.0, 0.0), Point2f::new(3.0, 4.0), Point2f::new(6.0, 0.0)];
        let b = [Point2f::new(0.0, 0.0); 3];
        let (mask, count) = score(&h, &a, &b, 5.0);
        assert_eq!(mask, vec![true, true, false]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_iteration_budget_shrinks_with_inlier_ratio() {
        assert_eq!(update_iterations(10, 10, 0.995, 2000), 0);
        let half = update_iterations(50, 100, 0.995, 2000);
        assert!(half > 50 && half < 2000, "{}", half);
        assert_eq!(update_iterations(1, 100, 0.995, 2000), 2000);
    }
}
