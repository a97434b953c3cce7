use thiserror::Error;

/// Errors raised by the stitching core (extraction, matching, estimation,
/// compositing). Application layers wrap these in `anyhow::Error`.
#[derive(Error, Debug)]
pub enum StitchError {
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
    #[error("No images to stitch")]
    EmptyInput,
    #[error("Not enough correspondences for a homography: found {found}, need 4")]
    InsufficientCorrespondences { found: usize },
    #[error("RANSAC found no consensus transform (best candidate had {inliers} inliers)")]
    NoConsensus { inliers: usize },
    #[error("Incompatible image: {0}")]
    IncompatibleImage(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid parameter(s): {0}")]
    InvalidParams(String),
}

impl StitchError {
    /// True for failures that only mean "this image could not be aligned",
    /// which the failure policy is allowed to skip over.
    pub fn is_alignment_failure(&self) -> bool {
        matches!(
            self,
            StitchError::InsufficientCorrespondences { .. } | StitchError::NoConsensus { .. }
        )
    }
}

pub type StitchResult<T> = Result<T, StitchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_failures_are_classified() {
        assert!(StitchError::InsufficientCorrespondences { found: 2 }.is_alignment_failure());
        assert!(StitchError::NoConsensus { inliers: 3 }.is_alignment_failure());
        assert!(!StitchError::Cancelled.is_alignment_failure());
        assert!(!StitchError::EmptyInput.is_alignment_failure());
    }

    #[test]
    fn test_error_messages_name_the_count() {
        let msg = StitchError::InsufficientCorrespondences { found: 3 }.to_string();
        assert!(msg.contains("found 3"));
    }
}
