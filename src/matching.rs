use opencv::core::{self, DMatch, Mat, Point2f};
use opencv::features2d;
use opencv::prelude::*;

use crate::error::StitchResult;
use crate::features::Features;

/// Lowe's ratio: the best match must be clearly closer than the runner-up.
pub const DEFAULT_RATIO: f32 = 0.7;

/// A query keypoint judged to show the same scene point as a reference keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub query: usize,
    pub reference: usize,
    pub distance: f32,
}

/// Match every query descriptor against its two nearest reference descriptors
/// and keep the unambiguous ones.
///
/// Output follows query order. Reference indices are not deduplicated, so one
/// reference keypoint may back several correspondences.
pub fn match_descriptors(
    query: &Mat,
    reference: &Mat,
    norm_type: i32,
    ratio: f32,
) -> StitchResult<Vec<Correspondence>> {
    if query.empty() || reference.empty() {
        return Ok(Vec::new());
    }

    let matcher = features2d::BFMatcher::create(norm_type, false)?;
    let mut knn_matches = core::Vector::<core::Vector<DMatch>>::new();
    matcher.knn_train_match(query, reference, &mut knn_matches, 2, &Mat::default(), false)?;

    let knn: Vec<Vec<DMatch>> = knn_matches.iter().map(|m| m.to_vec()).collect();
    let good = ratio_filter(&knn, ratio);

    log::debug!(
        "Ratio test kept {}/{} query descriptors (ratio {:.2})",
        good.len(),
        query.rows(),
        ratio
    );
    Ok(good)
}

/// The ratio test on precomputed k-nearest-neighbour lists.
///
/// Entries with fewer than two neighbours produce nothing.
pub fn ratio_filter(knn: &[Vec<DMatch>], ratio: f32) -> Vec<Correspondence> {
    knn.iter()
        .filter_map(|neighbours| match neighbours.as_slice() {
            [best, second, ..] if best.distance < ratio * second.distance => Some(Correspondence {
                query: best.query_idx as usize,
                reference: best.train_idx as usize,
                distance: best.distance,
            }),
            _ => None,
        })
        .collect()
}

/// Match `query` features against `reference` features with the norm for the
/// given descriptor family.
pub fn match_features(
    query: &Features,
    reference: &Features,
    norm_type: i32,
    ratio: f32,
) -> StitchResult<Vec<Correspondence>> {
    if query.is_empty() || reference.is_empty() {
        return Ok(Vec::new());
    }
    match_descriptors(&query.descriptors, &reference.descriptors, norm_type, ratio)
}

/// Split correspondences into two parallel point lists: positions in the
/// reference image (A) and positions in the query image (B).
pub fn correspondence_points(
    query: &Features,
    reference: &Features,
    matches: &[Correspondence],
) -> (Vec<Point2f>, Vec<Point2f>) {
    matches
        .iter()
        .map(|m| (reference.point(m.reference), query.point(m.query)))
        .unzip()
}
