mod batch;
mod canvas;
mod config;
mod display;
mod error;
mod features;
mod frames;
mod homography;
mod image_io;
mod logger;
mod manifest;
mod matching;
mod opencv_compat;
mod postprocess;
mod quality;
mod settings;
mod stitcher;
mod system_info;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::Parser;
use opencv::prelude::*;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use batch::{BatchOutcome, BatchScheduler, ProgressCallback};
use canvas::WarpExtent;
use config::AppConfig;
use features::FeatureDetector;
use frames::InputSource;
use stitcher::{stitch_images, FailurePolicy, Panorama, StepOutcome, Stitcher};

/// Stitch an ordered sequence of overlapping images or video frames into a
/// panorama.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Image directory, video file, or image files in stitching order
    paths: Vec<PathBuf>,

    /// Stitch in batches of this many images (implied when the input is
    /// longer than the configured batch size)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Directory for batch panoramas, the final panorama and extracted frames
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Show the panorama while it grows
    #[arg(long, default_value_t = false)]
    display: bool,

    /// Save the panorama of a single (non-batch) run
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Where `--save` writes the panorama
    #[arg(long, default_value = "stitched.png")]
    save_path: PathBuf,

    #[arg(long, value_enum)]
    detector: Option<FeatureDetector>,

    /// RANSAC seed (omit for a random seed each run)
    #[arg(long)]
    seed: Option<u64>,

    /// What to do with images and batches that cannot be aligned
    #[arg(long, value_enum)]
    on_failure: Option<FailurePolicy>,

    #[arg(long, value_enum)]
    warp_extent: Option<WarpExtent>,

    /// Maximum number of concurrently stitched batches
    #[arg(long)]
    workers: Option<usize>,

    /// Keep every n-th video frame
    #[arg(long)]
    frame_step: Option<usize>,

    /// Drop video frames whose sharpness score is below this
    #[arg(long)]
    min_sharpness: Option<f64>,

    /// Crop black margins off the result
    #[arg(long, default_value_t = false)]
    crop: bool,

    /// Stretch the result's intensities to the full 0-255 range
    #[arg(long, default_value_t = false)]
    normalize: bool,

    /// Settings file (JSON); defaults to the per-user settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long, default_value_t = false)]
    write_config: bool,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(size) = args.batch_size {
        config.batch.batch_size = size;
    }
    if let Some(detector) = args.detector {
        config.stitch.features.detector = detector;
    }
    if args.seed.is_some() {
        config.stitch.seed = args.seed;
    }
    if let Some(policy) = args.on_failure {
        config.stitch.on_failure = policy;
        config.batch.on_batch_failure = policy;
    }
    if let Some(extent) = args.warp_extent {
        config.stitch.warp_extent = extent;
    }
    if let Some(workers) = args.workers {
        config.batch.max_workers = workers;
    }
    if let Some(step) = args.frame_step {
        config.frames.frame_step = step;
    }
    if args.min_sharpness.is_some() {
        config.frames.min_sharpness = args.min_sharpness;
    }
    if args.crop {
        config.batch.crop_final = true;
    }
    if args.normalize {
        config.batch.normalize_final = true;
    }
    if args.display {
        config.display.enabled = true;
    }
}

fn use_batches(args: &Args, config: &AppConfig, input_count: usize) -> bool {
    args.batch_size.is_some() || input_count > config.batch.batch_size
}

fn run(args: Args) -> Result<()> {
    let mut config = settings::load_settings(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    if args.write_config {
        settings::save_settings(&config, args.config.as_deref())?;
        if args.paths.is_empty() {
            return Ok(());
        }
    }

    let source = InputSource::classify(&args.paths)?;
    let inputs = source.resolve(&args.output_dir, &config.frames)?;
    log::info!("{} input images", inputs.len());

    if use_batches(&args, &config, inputs.len()) {
        run_batches(&inputs, &args.output_dir, &config)
    } else {
        run_single(&inputs, &args, &config)
    }
}

fn run_single(inputs: &[PathBuf], args: &Args, config: &AppConfig) -> Result<()> {
    let start = std::time::Instant::now();

    let pano = if config.display.enabled {
        stitch_with_preview(inputs, config)?
    } else {
        let images = inputs
            .par_iter()
            .map(|path| image_io::load_image(path))
            .collect::<Result<Vec<_>>>()?;
        stitch_images(images, &config.stitch)?
    };
    log::info!(
        "Panorama {}x{} from {} images ({} skipped) in {:?}",
        pano.image.cols(),
        pano.image.rows(),
        pano.accepted,
        pano.skipped.len(),
        start.elapsed()
    );

    let image = postprocess::finalize(
        pano.image,
        config.batch.crop_final,
        config.batch.normalize_final,
    )?;

    if args.save {
        image_io::save_image(&args.save_path, &image)?;
    }
    if config.display.enabled {
        show_result(&image, config)?;
    }
    Ok(())
}

/// Stitch image by image, showing the canvas after every step. `q` or Esc
/// stops early and keeps what has been stitched so far.
fn stitch_with_preview(inputs: &[PathBuf], config: &AppConfig) -> Result<Panorama> {
    let mut stitcher = Stitcher::new(config.stitch.clone());

    for (i, path) in inputs.iter().enumerate() {
        let img = image_io::load_image(path)?;
        let outcome = stitcher
            .add_image(img)
            .with_context(|| format!("Failed to stitch {}", path.display()))?;
        if let StepOutcome::Composited { homography, .. } = &outcome {
            log::debug!("{}: H = {:?}", path.display(), homography.m);
        }

        if let Some(canvas) = stitcher.canvas() {
            display::show("panorama", canvas, config.display.max_pixels)?;
            if display::wait(config.display.frame_delay_ms)? {
                log::info!("Stopped by user after {} of {} images", i + 1, inputs.len());
                break;
            }
        }
    }

    Ok(stitcher.finish()?)
}

fn run_batches(inputs: &[PathBuf], output_dir: &Path, config: &AppConfig) -> Result<()> {
    let progress: ProgressCallback = Arc::new(Mutex::new(|msg: String, pct: f32| {
        log::info!("[{:>3.0}%] {}", pct, msg);
    }));
    let cancel_flag = Arc::new(AtomicBool::new(false));

    let scheduler = BatchScheduler::new(config.stitch.clone(), config.batch.clone())
        .with_progress(progress)
        .with_cancel_flag(cancel_flag.clone());

    let report = if config.display.enabled {
        // highgui stays on this thread; q/Esc in the preview cancels the run
        std::thread::scope(|scope| -> Result<_> {
            let worker = scope.spawn(|| scheduler.run(inputs, output_dir));
            if let Some(first) = inputs.first() {
                display::show("panorama", &image_io::load_image(first)?, config.display.max_pixels)?;
            }
            while !worker.is_finished() {
                if display::wait(100)? && !cancel_flag.swap(true, Ordering::Relaxed) {
                    log::info!("Cancelling batch run...");
                }
            }
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("Batch worker panicked"))?
        })?
    } else {
        scheduler.run(inputs, output_dir)?
    };

    for outcome in report.failed() {
        if let BatchOutcome::Failed { index, range, error } = outcome {
            log::warn!(
                "Batch {} (images {}..{}) failed: {}",
                index,
                range.start,
                range.end,
                error
            );
        }
    }

    if let Some(path) = &report.final_path {
        log::info!(
            "Final panorama from {} of {} batches: {}",
            report.merged_batches,
            report.batches.len(),
            path.display()
        );
        if config.display.enabled {
            show_result(&image_io::load_image(path)?, config)?;
        }
    }
    Ok(())
}

fn show_result(image: &Mat, config: &AppConfig) -> Result<()> {
    display::show("panorama", image, config.display.max_pixels)?;
    display::wait(0)?;
    display::close_all()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logger::DualLogger::init(args.debug, args.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_overrides_settings() {
        let args = Args::parse_from([
            "panostitch",
            "frames",
            "--batch-size",
            "10",
            "--detector",
            "orb",
            "--seed",
            "3",
            "--on-failure",
            "abort",
            "--warp-extent",
            "source",
            "--workers",
            "2",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.stitch.features.detector, FeatureDetector::ORB);
        assert_eq!(config.stitch.seed, Some(3));
        assert_eq!(config.stitch.on_failure, FailurePolicy::Abort);
        assert_eq!(config.batch.on_batch_failure, FailurePolicy::Abort);
        assert_eq!(config.stitch.warp_extent, WarpExtent::Source);
        assert_eq!(config.batch.max_workers, 2);
        assert!(use_batches(&args, &config, 3));
    }

    #[test]
    fn test_short_sequences_stitch_in_one_pass() {
        let args = Args::parse_from(["panostitch", "a.jpg", "b.jpg", "--crop", "--normalize"]);
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &args);

        assert!(config.batch.crop_final);
        assert!(config.batch.normalize_final);

        assert_eq!(config.stitch.seed, None);
        assert!(!use_batches(&args, &config, 2));
        assert!(use_batches(&args, &config, 26));
        assert_eq!(args.save_path, PathBuf::from("stitched.png"));
    }
}
