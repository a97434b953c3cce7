use opencv::core::Mat;
use opencv::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::canvas::{Canvas, WarpExtent};
use crate::error::{StitchError, StitchResult};
use crate::features::{extract_features, FeatureConfig, Features};
use crate::homography::{estimate_homography, Homography, RansacParams};
use crate::matching::{self, correspondence_points, match_features};

/// What to do when an image (or a whole batch) cannot be aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Leave the canvas untouched and continue with the next input.
    Skip,
    /// Stop and report the failure.
    Abort,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Skip => write!(f, "skip"),
            FailurePolicy::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    pub features: FeatureConfig,
    pub match_ratio: f32,
    pub ransac: RansacParams,
    /// Seed for RANSAC sampling; `None` draws a fresh seed per run.
    pub seed: Option<u64>,
    pub on_failure: FailurePolicy,
    pub warp_extent: WarpExtent,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            match_ratio: matching::DEFAULT_RATIO,
            ransac: RansacParams::default(),
            seed: None,
            on_failure: FailurePolicy::Skip,
            warp_extent: WarpExtent::Canvas,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug)]
pub enum StepOutcome {
    /// First image: became the canvas.
    Initialized,
    /// Aligned and appended; carries the transform and the width added.
    Composited {
        homography: Homography,
        inliers: usize,
        added_width: i32,
    },
    Skipped(StitchError),
}

/// Final state of a stitching run.
#[derive(Debug)]
pub struct Panorama {
    pub image: Mat,
    pub accepted: usize,
    pub skipped: Vec<SkippedImage>,
    /// Widths appended for each accepted non-initial image, in order.
    pub warped_widths: Vec<i32>,
}

/// Incremental pairwise stitcher.
///
/// Each new image is matched only against the last image that made it into
/// the canvas; there is no global feature index, so drift accumulates over
/// long sequences.
pub struct Stitcher {
    config: StitchConfig,
    rng: ChaCha8Rng,
    canvas: Option<Canvas>,
    last: Option<Features>,
    seen: usize,
    accepted: usize,
    skipped: Vec<SkippedImage>,
    warped_widths: Vec<i32>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl Stitcher {
    pub fn new(config: StitchConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            config,
            rng,
            canvas: None,
            last: None,
            seen: 0,
            accepted: 0,
            skipped: Vec::new(),
            warped_widths: Vec::new(),
            cancel_flag: None,
        }
    }

    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel_flag = Some(flag);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    pub fn canvas(&self) -> Option<&Mat> {
        self.canvas.as_ref().map(|c| c.as_mat())
    }

    /// Feed the next image of the sequence.
    pub fn add_image(&mut self, img: Mat) -> StitchResult<StepOutcome> {
        if self.is_cancelled() {
            return Err(StitchError::Cancelled);
        }
        let index = self.seen;
        self.seen += 1;

        let features = extract_features(&img, &self.config.features)?;

        let canvas = match self.canvas.take() {
            None => {
                log::info!(
                    "Image {}: initial canvas {}x{} ({} keypoints)",
                    index,
                    img.cols(),
                    img.rows(),
                    features.len()
                );
                self.canvas = Some(Canvas::new(img)?);
                self.last = Some(features);
                self.accepted += 1;
                return Ok(StepOutcome::Initialized);
            }
            Some(canvas) => canvas,
        };

        let (homography, inliers) = match self.align(&features) {
            Ok(aligned) => aligned,
            Err(e) if e.is_alignment_failure() => {
                self.canvas = Some(canvas);
                return self.on_alignment_failure(index, e);
            }
            Err(e) => {
                self.canvas = Some(canvas);
                return Err(e);
            }
        };

        let (grown, added_width) = canvas.composite(&img, &homography, self.config.warp_extent)?;
        log::info!(
            "Image {}: {} inliers, appended {}px -> canvas {}x{}",
            index,
            inliers,
            added_width,
            grown.width(),
            grown.height()
        );

        self.canvas = Some(grown);
        self.last = Some(features);
        self.accepted += 1;
        self.warped_widths.push(added_width);

        Ok(StepOutcome::Composited {
            homography,
            inliers,
            added_width,
        })
    }

    fn align(&mut self, features: &Features) -> StitchResult<(Homography, usize)> {
        let reference = self.last.as_ref().ok_or(StitchError::EmptyInput)?;
        let matches = match_features(
            features,
            reference,
            self.config.features.detector.norm_type(),
            self.config.match_ratio,
        )?;
        let (points_a, points_b) = correspondence_points(features, reference, &matches);
        let estimate = estimate_homography(&points_a, &points_b, &self.config.ransac, &mut self.rng)?;
        Ok((estimate.homography, estimate.inlier_count))
    }

    fn on_alignment_failure(&mut self, index: usize, err: StitchError) -> StitchResult<StepOutcome> {
        match self.config.on_failure {
            FailurePolicy::Skip => {
                log::warn!("Image {}: skipped ({})", index, err);
                self.skipped.push(SkippedImage {
                    index,
                    reason: err.to_string(),
                });
                Ok(StepOutcome::Skipped(err))
            }
            FailurePolicy::Abort => {
                log::error!("Image {}: cannot be aligned, aborting ({})", index, err);
                Err(err)
            }
        }
    }

    pub fn finish(self) -> StitchResult<Panorama> {
        let canvas = self.canvas.ok_or(StitchError::EmptyInput)?;
        Ok(Panorama {
            image: canvas.into_mat(),
            accepted: self.accepted,
            skipped: self.skipped,
            warped_widths: self.warped_widths,
        })
    }
}

/// Stitch an ordered image sequence into one panorama.
pub fn stitch_images<I>(images: I, config: &StitchConfig) -> StitchResult<Panorama>
where
    I: IntoIterator<Item = Mat>,
{
    let mut stitcher = Stitcher::new(config.clone());
    for img in images {
        stitcher.add_image(img)?;
    }
    stitcher.finish()
}
