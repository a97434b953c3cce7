use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::display::DisplayConfig;
use crate::quality::FrameFilterConfig;
use crate::stitcher::StitchConfig;

/// Everything a run can be configured with. Missing sections and fields in a
/// settings file fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stitch: StitchConfig,
    pub batch: BatchConfig,
    pub display: DisplayConfig,
    pub frames: FrameFilterConfig,
}
