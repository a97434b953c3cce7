//! Run manifest
//!
//! Every batch run leaves a `manifest.yml` next to its panoramas describing
//! which inputs went into which batch and how each batch ended.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::batch::{BatchOutcome, BatchReport};

pub const MANIFEST_FILE: &str = "manifest.yml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Failed,
}

/// One batch of the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub index: usize,

    /// Input file names, in stitching order
    pub inputs: Vec<String>,

    pub status: BatchStatus,

    /// Panorama file name, absent for failed batches
    pub output: Option<String>,

    pub accepted: usize,
    pub skipped: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Timestamp when the run finished
    pub timestamp: String,

    pub input_count: usize,
    pub batch_size: usize,
    pub batches: Vec<BatchEntry>,

    pub final_panorama: Option<String>,

    /// Final panorama dimensions (width, height)
    pub final_size: Option<(i32, i32)>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

impl RunManifest {
    pub fn from_report(report: &BatchReport, inputs: &[std::path::PathBuf], batch_size: usize) -> Self {
        let batches = report
            .batches
            .iter()
            .map(|outcome| {
                let index = outcome.index();
                let range = outcome.range();
                let inputs = inputs[range.clone()].iter().map(|p| file_name(p)).collect();
                match outcome {
                    BatchOutcome::Completed {
                        path,
                        accepted,
                        skipped,
                        ..
                    } => BatchEntry {
                        index,
                        inputs,
                        status: BatchStatus::Completed,
                        output: Some(file_name(path)),
                        accepted: *accepted,
                        skipped: *skipped,
                        error: None,
                    },
                    BatchOutcome::Failed { error, .. } => BatchEntry {
                        index,
                        inputs,
                        status: BatchStatus::Failed,
                        output: None,
                        accepted: 0,
                        skipped: 0,
                        error: Some(error.clone()),
                    },
                }
            })
            .collect();

        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            input_count: inputs.len(),
            batch_size,
            batches,
            final_panorama: report.final_path.as_deref().map(file_name),
            final_size: report.final_size,
        }
    }

    pub fn save_to_file(&self, yaml_path: &Path) -> Result<()> {
        let yaml_content = serde_yaml::to_string(self)?;
        std::fs::write(yaml_path, yaml_content)
            .with_context(|| format!("Failed to write {}", yaml_path.display()))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn load_from_file(yaml_path: &Path) -> Result<Self> {
        let yaml_content = std::fs::read_to_string(yaml_path)
            .with_context(|| format!("Failed to read {}", yaml_path.display()))?;
        let manifest: RunManifest = serde_yaml::from_str(&yaml_content)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_report(dir: &Path) -> BatchReport {
        BatchReport {
            batches: vec![
                BatchOutcome::Completed {
                    index: 0,
                    range: 0..2,
                    path: dir.join("panorama_batch_0.jpg"),
                    width: 380,
                    height: 200,
                    accepted: 2,
                    skipped: 0,
                },
                BatchOutcome::Failed {
                    index: 1,
                    range: 2..3,
                    error: "not enough correspondences".to_string(),
                },
            ],
            final_path: Some(dir.join("final_panorama.jpg")),
            final_size: Some((380, 200)),
            merged_batches: 1,
        }
    }

    #[test]
    fn test_manifest_survives_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> = ["a.jpg", "b.jpg", "c.jpg"]
            .iter()
            .map(|n| dir.path().join(n))
            .collect();
        let manifest = RunManifest::from_report(&sample_report(dir.path()), &inputs, 2);

        let path = dir.path().join(MANIFEST_FILE);
        manifest.save_to_file(&path).unwrap();
        let loaded = RunManifest::load_from_file(&path).unwrap();

        assert_eq!(loaded.input_count, 3);
        assert_eq!(loaded.batches.len(), 2);
        assert_eq!(loaded.batches[0].inputs, vec!["a.jpg", "b.jpg"]);
        assert_eq!(loaded.batches[0].output.as_deref(), Some("panorama_batch_0.jpg"));
        assert_eq!(loaded.batches[1].status, BatchStatus::Failed);
        assert_eq!(loaded.batches[1].inputs, vec!["c.jpg"]);
        assert_eq!(loaded.final_panorama.as_deref(), Some("final_panorama.jpg"));
        assert_eq!(loaded.final_size, Some((380, 200)));
    }
}
