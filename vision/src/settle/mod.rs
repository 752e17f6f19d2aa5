//! Settle detection: wait until the camera image stops changing.

pub mod analyzer;
pub mod debounce;
pub mod metric;
pub mod raster;

use std::sync::Arc;
use std::time::Duration;

use frame_settle_common::config::SettleConfig;
use frame_settle_common::Frame;

pub use analyzer::SettleAnalyzer;
pub use debounce::Debouncer;
pub use metric::DifferenceMetric;

use crate::error::VisionError;
use crate::source::FrameSource;

/// Outcome of one settle cycle.
#[derive(Debug, Clone)]
pub struct SettleResult {
    /// The last captured frame, untransformed by settle preprocessing.
    pub frame: Arc<Frame>,
    pub elapsed: Duration,
    /// Last difference score, `None` for fixed-time settling.
    pub score: Option<f64>,
    pub frames_captured: u32,
    /// The cycle ended on the timeout rather than on a still scene.
    pub timed_out: bool,
}

/// Settle directly on a frame source, without transform or diagnostics.
pub fn settle(source: &dyn FrameSource, config: &SettleConfig) -> Result<SettleResult, VisionError> {
    SettleAnalyzer::new(config.clone()).settle(|| Ok(source.capture()?), None)
}
