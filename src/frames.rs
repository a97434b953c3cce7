//! Where input images come from: a directory, an explicit file list, or a
//! video whose frames are extracted to disk first.

use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;
use std::path::{Path, PathBuf};

use crate::image_io::{is_image_file, list_image_files, save_image};
use crate::quality::{compute_sharpness, FrameFilterConfig};

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "m4v", "mpg", "mpeg"];

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Directory(PathBuf),
    Video(PathBuf),
    /// Explicit image files, stitched in the given order.
    Files(Vec<PathBuf>),
}

impl InputSource {
    pub fn classify(paths: &[PathBuf]) -> Result<Self> {
        match paths {
            [] => anyhow::bail!("No input paths given"),
            [single] if single.is_dir() => Ok(InputSource::Directory(single.clone())),
            [single] if is_video_file(single) => Ok(InputSource::Video(single.clone())),
            many if many.iter().all(|p| is_image_file(p)) => Ok(InputSource::Files(many.to_vec())),
            _ => anyhow::bail!(
                "Inputs must be one directory, one video, or a list of image files"
            ),
        }
    }

    /// Ordered image files for this source. Videos are decoded into
    /// `work_dir/frames` first.
    pub fn resolve(&self, work_dir: &Path, filter: &FrameFilterConfig) -> Result<Vec<PathBuf>> {
        match self {
            InputSource::Directory(dir) => list_image_files(dir),
            InputSource::Video(video) => extract_frames(video, &work_dir.join("frames"), filter),
            InputSource::Files(files) => {
                if let Some(missing) = files.iter().find(|p| !p.is_file()) {
                    anyhow::bail!("Input image not found: {}", missing.display());
                }
                Ok(files.clone())
            }
        }
    }
}

/// Decode `video` and write the frames that pass `filter` as
/// `frame_<NNNN>.jpg` (1-based decode index) into `output_dir`.
pub fn extract_frames(
    video: &Path,
    output_dir: &Path,
    filter: &FrameFilterConfig,
) -> Result<Vec<PathBuf>> {
    let video_str = video
        .to_str()
        .with_context(|| format!("Path is not valid UTF-8: {}", video.display()))?;
    let mut cap = videoio::VideoCapture::from_file(video_str, videoio::CAP_ANY)
        .with_context(|| format!("Could not open video {}", video.display()))?;
    if !cap.is_opened()? {
        anyhow::bail!("Could not open video file {}", video.display());
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    log::info!("Extracting frames from {}", video.display());
    let start = std::time::Instant::now();

    let mut written = Vec::new();
    let mut index = 0usize;
    let mut rejected_blurry = 0usize;
    loop {
        let mut frame = Mat::default();
        if !cap.read(&mut frame)? || frame.empty() {
            break;
        }

        let sharpness = if filter.min_sharpness.is_some() && filter.wants_index(index) {
            Some(compute_sharpness(&frame)?)
        } else {
            None
        };

        if filter.accepts(index, sharpness) {
            let path = output_dir.join(format!("frame_{:04}.jpg", index + 1));
            save_image(&path, &frame)?;
            written.push(path);
        } else if filter.wants_index(index) {
            rejected_blurry += 1;
            log::debug!("Frame {} rejected as blurry ({:?})", index + 1, sharpness);
        }
        index += 1;
    }

    log::info!(
        "Decoded {} frames in {:?}: kept {}, rejected {} as blurry",
        index,
        start.elapsed(),
        written.len(),
        rejected_blurry
    );

    if written.is_empty() {
        anyhow::bail!("No usable frames in {}", video.display());
    }
    Ok(written)
}
