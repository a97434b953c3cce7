use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Path is not valid UTF-8: {}", path.display()))
}

/// Load an image from disk with timing and logging
pub fn load_image(path: &Path) -> Result<Mat> {
    let start = std::time::Instant::now();
    let filename = path.file_name().unwrap_or_default().to_string_lossy();

    let img = imgcodecs::imread(path_str(path)?, imgcodecs::IMREAD_COLOR)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if img.empty() {
        anyhow::bail!("Could not decode image {}", path.display());
    }

    log::debug!(
        "Loaded {} in {:?} - Size: {}x{}, Channels: {}",
        filename,
        start.elapsed(),
        img.cols(),
        img.rows(),
        img.channels()
    );

    Ok(img)
}

/// Encode `img` to `path`, creating the parent directory if needed.
pub fn save_image(path: &Path, img: &Mat) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let written = imgcodecs::imwrite(path_str(path)?, img, &opencv::core::Vector::new())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    if !written {
        anyhow::bail!("Image encoder refused to write {}", path.display());
    }

    log::info!("Saved {}x{} image to {}", img.cols(), img.rows(), path.display());
    Ok(())
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot open input directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    if files.is_empty() {
        anyhow::bail!("No images found in {}", dir.display());
    }
    Ok(files)
}

pub fn batch_panorama_name(index: usize, ext: &str) -> String {
    format!("panorama_batch_{}.{}", index, ext)
}

pub fn final_panorama_name(ext: &str) -> String {
    format!("final_panorama.{}", ext)
}
