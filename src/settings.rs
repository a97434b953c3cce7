use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("panostitch")
        .join("settings.json")
}

pub fn save_settings(config: &AppConfig, path: Option<&Path>) -> Result<PathBuf> {
    let settings_path = path.map(Path::to_path_buf).unwrap_or_else(default_settings_path);

    if let Some(parent) = settings_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&settings_path, json)
        .with_context(|| format!("Failed to write {}", settings_path.display()))?;

    log::info!("Settings saved to: {}", settings_path.display());
    Ok(settings_path)
}

/// Load settings from `explicit`, or from the per-user settings file.
///
/// A broken explicit file is an error; a broken per-user file only warns
/// and falls back to defaults.
pub fn load_settings(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        log::info!("Settings loaded from: {}", path.display());
        return Ok(config);
    }

    let settings_path = default_settings_path();
    if !settings_path.exists() {
        log::info!("No settings file found. Using defaults.");
        return Ok(AppConfig::default());
    }

    let config = match std::fs::read_to_string(&settings_path) {
        Ok(json) => match serde_json::from_str(&json) {
            Ok(config) => {
                log::info!("Settings loaded from: {}", settings_path.display());
                config
            }
            Err(e) => {
                log::warn!("Failed to parse settings file: {}. Using defaults.", e);
                AppConfig::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read settings file: {}. Using defaults.", e);
            AppConfig::default()
        }
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDetector;

    #[test]
    fn test_explicit_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("settings.json");

        let mut config = AppConfig::default();
        config.batch.batch_size = 7;
        config.stitch.features.detector = FeatureDetector::AKAZE;
        config.stitch.seed = Some(99);
        save_settings(&config, Some(&path)).unwrap();

        let loaded = load_settings(Some(&path)).unwrap();
        assert_eq!(loaded.batch.batch_size, 7);
        assert_eq!(loaded.stitch.features.detector, FeatureDetector::AKAZE);
        assert_eq!(loaded.stitch.seed, Some(99));
    }

    #[test]
    fn test_broken_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_settings(Some(&path)).is_err());
        assert!(load_settings(Some(&dir.path().join("missing.json"))).is_err());
    }
}
