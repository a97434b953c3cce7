//! Batch scheduler
//!
//! Long sequences are cut into fixed-size contiguous batches. Each batch is
//! stitched on its own worker and written to `panorama_batch_<i>.<ext>`;
//! once every worker has finished, the batch panoramas are read back in
//! index order and stitched once more into `final_panorama.<ext>`.

use anyhow::{Context, Result};
use opencv::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::canvas::WarpExtent;
use crate::error::{StitchError, StitchResult};
use crate::image_io::{batch_panorama_name, final_panorama_name, load_image, save_image};
use crate::manifest::{RunManifest, MANIFEST_FILE};
use crate::postprocess;
use crate::stitcher::{FailurePolicy, StitchConfig, Stitcher};
use crate::system_info;

/// Progress callback: (message, percentage)
pub type ProgressCallback = Arc<Mutex<dyn FnMut(String, f32) + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    /// Upper bound on concurrently stitched batches.
    pub max_workers: usize,
    /// Extension (and encoder) of the batch and final panoramas.
    pub image_format: String,
    pub on_batch_failure: FailurePolicy,
    /// Trim black margins off the final panorama.
    pub crop_final: bool,
    /// Stretch the final panorama's intensities to the full 0..255 range.
    pub normalize_final: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_workers: 8,
            image_format: "jpg".to_string(),
            on_batch_failure: FailurePolicy::Skip,
            crop_final: false,
            normalize_final: false,
        }
    }
}

/// Split `0..len` into contiguous ranges of `batch_size` (the last one may
/// be shorter).
pub fn partition(len: usize, batch_size: usize) -> StitchResult<Vec<Range<usize>>> {
    if batch_size == 0 {
        return Err(StitchError::InvalidParams(
            "batch size must be at least 1".to_string(),
        ));
    }
    Ok((0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect())
}

/// Columns of a panorama stitched from `images` inputs that are `width`
/// columns wide. Under `Canvas` every step doubles the width. Saturates
/// instead of overflowing.
pub fn projected_width(width: i32, images: usize, extent: WarpExtent) -> u64 {
    let width = width.max(0) as u64;
    match extent {
        WarpExtent::Source => width.saturating_mul(images as u64),
        WarpExtent::Canvas => {
            let growth = u32::try_from(images.saturating_sub(1))
                .ok()
                .and_then(|steps| 1u64.checked_shl(steps))
                .unwrap_or(u64::MAX);
            width.saturating_mul(growth)
        }
    }
}

/// Longest batch whose panorama still fits in `i32::MAX` columns.
pub fn max_batch_len(width: i32, extent: WarpExtent) -> usize {
    let fit = i32::MAX as u64 / width.max(1) as u64;
    match extent {
        WarpExtent::Source => fit as usize,
        WarpExtent::Canvas => fit.max(1).ilog2() as usize + 1,
    }
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Completed {
        index: usize,
        range: Range<usize>,
        path: PathBuf,
        width: i32,
        height: i32,
        accepted: usize,
        skipped: usize,
    },
    Failed {
        index: usize,
        range: Range<usize>,
        error: String,
    },
}

impl BatchOutcome {
    pub fn index(&self) -> usize {
        match self {
            BatchOutcome::Completed { index, .. } | BatchOutcome::Failed { index, .. } => *index,
        }
    }

    /// Positions of this batch's images in the input list.
    pub fn range(&self) -> &Range<usize> {
        match self {
            BatchOutcome::Completed { range, .. } | BatchOutcome::Failed { range, .. } => range,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    /// One entry per batch, in index order.
    pub batches: Vec<BatchOutcome>,
    pub final_path: Option<PathBuf>,
    pub final_size: Option<(i32, i32)>,
    /// Batch panoramas that made it into the final merge.
    pub merged_batches: usize,
}

impl BatchReport {
    pub fn failed(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.batches
            .iter()
            .filter(|b| matches!(b, BatchOutcome::Failed { .. }))
    }
}

pub struct BatchScheduler {
    stitch: StitchConfig,
    batch: BatchConfig,
    cancel_flag: Arc<AtomicBool>,
    progress_cb: Option<ProgressCallback>,
}

impl BatchScheduler {
    pub fn new(stitch: StitchConfig, batch: BatchConfig) -> Self {
        Self {
            stitch,
            batch,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            progress_cb: None,
        }
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    pub fn with_progress(mut self, cb: ProgressCallback) -> Self {
        self.progress_cb = Some(cb);
        self
    }

    fn report_progress(&self, msg: &str, pct: f32) {
        if let Some(ref cb) = self.progress_cb {
            if let Ok(mut cb_lock) = cb.lock() {
                cb_lock(msg.to_string(), pct);
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    /// Stitch `inputs` batch by batch into `output_dir`.
    pub fn run(&self, inputs: &[PathBuf], output_dir: &Path) -> Result<BatchReport> {
        if inputs.is_empty() {
            return Err(StitchError::EmptyInput.into());
        }
        let ranges = partition(inputs.len(), self.batch.batch_size)?;
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let workers = self.plan_workers(inputs, &ranges)?;
        log::info!(
            "Stitching {} images in {} batches of up to {} on {} workers",
            inputs.len(),
            ranges.len(),
            self.batch.batch_size,
            workers
        );
        self.report_progress("Starting batches...", 0.0);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("batch-worker-{}", i))
            .build()?;

        let done = AtomicUsize::new(0);
        let total = ranges.len();
        let batches: Vec<BatchOutcome> = pool.install(|| {
            ranges
                .par_iter()
                .enumerate()
                .map(|(index, range)| {
                    let outcome = self.run_batch(index, range.clone(), inputs, output_dir);
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.report_progress(
                        &format!("Batch {}/{} finished", finished, total),
                        finished as f32 / total as f32 * 80.0,
                    );
                    outcome
                })
                .collect()
        });

        if self.is_cancelled() {
            log::info!("Batch run cancelled, skipping final merge");
            return Err(StitchError::Cancelled.into());
        }

        let mut report = BatchReport {
            batches,
            final_path: None,
            final_size: None,
            merged_batches: 0,
        };

        if let Some(BatchOutcome::Failed { index, error, .. }) = report.failed().next() {
            match self.batch.on_batch_failure {
                FailurePolicy::Abort => {
                    let message = format!("Batch {} failed: {}", index, error);
                    self.write_manifest(&report, inputs, output_dir)?;
                    anyhow::bail!(message);
                }
                FailurePolicy::Skip => {
                    for failed in report.failed() {
                        if let BatchOutcome::Failed { index, error, .. } = failed {
                            log::warn!("Batch {} left out of the final panorama: {}", index, error);
                        }
                    }
                }
            }
        }

        self.report_progress("Merging batch panoramas...", 85.0);
        let merged = self.merge(&mut report, output_dir, total);
        self.write_manifest(&report, inputs, output_dir)?;
        merged?;
        self.report_progress("Done", 100.0);
        Ok(report)
    }

    /// Size the worker pool from the projected footprint of the longest
    /// batch. Batches whose panorama cannot be represented are rejected.
    fn plan_workers(&self, inputs: &[PathBuf], ranges: &[Range<usize>]) -> Result<usize> {
        let longest = ranges.iter().map(|r| r.len()).max().unwrap_or(0);
        let extent = self.stitch.warp_extent;

        let per_batch_mb = match load_image(&inputs[0]) {
            Ok(img) => {
                let columns = projected_width(img.cols(), longest, extent);
                if columns > i32::MAX as u64 {
                    return Err(StitchError::InvalidParams(format!(
                        "a batch of {} images grows the canvas to {} columns under the {} warp extent; \
                         lower batch_size to at most {} or use the source warp extent",
                        longest,
                        columns,
                        extent,
                        max_batch_len(img.cols(), extent)
                    ))
                    .into());
                }
                let image_mb =
                    system_info::estimate_image_size_mb(img.cols(), img.rows(), img.channels());
                // canvas, warped buffer and their concatenation are alive together
                image_mb * (columns as f64 / img.cols().max(1) as f64) * 2.0
            }
            Err(e) => {
                log::debug!("Cannot size batches from {}: {:#}", inputs[0].display(), e);
                0.0
            }
        };

        let available_gb = system_info::get_available_memory_gb();
        let usable_mb = available_gb * 0.5 * 1024.0;
        if per_batch_mb > usable_mb {
            log::warn!(
                "One batch of {} images may need ~{:.0} MB, more than the {:.0} MB budget; lower batch_size (now {})",
                longest,
                per_batch_mb,
                usable_mb,
                self.batch.batch_size
            );
        }

        let limit = system_info::worker_limit(available_gb, per_batch_mb, self.batch.max_workers);
        log::debug!(
            "{:.2} GB RAM available, ~{:.1} MB per batch ({} extent) -> {} workers",
            available_gb,
            per_batch_mb,
            extent,
            limit
        );
        Ok(limit.min(ranges.len()).max(1))
    }

    fn run_batch(
        &self,
        index: usize,
        range: Range<usize>,
        inputs: &[PathBuf],
        output_dir: &Path,
    ) -> BatchOutcome {
        if self.is_cancelled() {
            return BatchOutcome::Failed {
                index,
                range,
                error: StitchError::Cancelled.to_string(),
            };
        }
        match self.stitch_batch(index, &inputs[range.clone()], output_dir) {
            Ok((path, width, height, accepted, skipped)) => {
                log::info!(
                    "Batch {}: {} of {} images -> {}x{} {}",
                    index,
                    accepted,
                    range.len(),
                    width,
                    height,
                    path.display()
                );
                BatchOutcome::Completed {
                    index,
                    range,
                    path,
                    width,
                    height,
                    accepted,
                    skipped,
                }
            }
            Err(e) => {
                log::error!("Batch {} failed: {:#}", index, e);
                BatchOutcome::Failed {
                    index,
                    range,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    fn stitch_batch(
        &self,
        index: usize,
        paths: &[PathBuf],
        output_dir: &Path,
    ) -> Result<(PathBuf, i32, i32, usize, usize)> {
        let mut stitcher = Stitcher::new(self.seeded_config(index));
        stitcher.set_cancel_flag(self.cancel_flag.clone());
        for path in paths {
            let img = load_image(path)?;
            stitcher
                .add_image(img)
                .with_context(|| format!("while stitching {}", path.display()))?;
        }
        let pano = stitcher.finish()?;

        // no partial panoramas once cancelled
        if self.is_cancelled() {
            return Err(StitchError::Cancelled.into());
        }
        let path = output_dir.join(batch_panorama_name(index, &self.batch.image_format));
        save_image(&path, &pano.image)?;
        Ok((
            path,
            pano.image.cols(),
            pano.image.rows(),
            pano.accepted,
            pano.skipped.len(),
        ))
    }

    /// Per-batch RNG streams stay reproducible for a fixed seed.
    fn seeded_config(&self, stream: usize) -> StitchConfig {
        let mut config = self.stitch.clone();
        config.seed = config.seed.map(|seed| seed.wrapping_add(stream as u64));
        config
    }

    fn merge(&self, report: &mut BatchReport, output_dir: &Path, stream: usize) -> Result<()> {
        let panoramas: Vec<&PathBuf> = report
            .batches
            .iter()
            .filter_map(|b| match b {
                BatchOutcome::Completed { path, .. } => Some(path),
                BatchOutcome::Failed { .. } => None,
            })
            .collect();
        if panoramas.is_empty() {
            anyhow::bail!("No batch produced a panorama");
        }
        log::info!("Merging {} batch panoramas", panoramas.len());

        let mut stitcher = Stitcher::new(self.seeded_config(stream));
        stitcher.set_cancel_flag(self.cancel_flag.clone());
        for path in &panoramas {
            let img = load_image(path)?;
            stitcher
                .add_image(img)
                .with_context(|| format!("while merging {}", path.display()))?;
        }
        let pano = stitcher.finish()?;
        for skipped in &pano.skipped {
            log::warn!(
                "Batch panorama {} could not be merged: {}",
                panoramas[skipped.index].display(),
                skipped.reason
            );
        }

        let image = postprocess::finalize(
            pano.image,
            self.batch.crop_final,
            self.batch.normalize_final,
        )?;

        let final_path = output_dir.join(final_panorama_name(&self.batch.image_format));
        save_image(&final_path, &image)?;
        log::info!(
            "Final panorama {}x{} from {} batches",
            image.cols(),
            image.rows(),
            pano.accepted
        );

        report.final_path = Some(final_path);
        report.final_size = Some((image.cols(), image.rows()));
        report.merged_batches = pano.accepted;
        Ok(())
    }

    fn write_manifest(&self, report: &BatchReport, inputs: &[PathBuf], output_dir: &Path) -> Result<()> {
        let manifest = RunManifest::from_report(report, inputs, self.batch.batch_size);
        manifest.save_to_file(&output_dir.join(MANIFEST_FILE))
    }
}
