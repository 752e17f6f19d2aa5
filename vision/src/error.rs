use frame_settle_common::FrameError;

use crate::motion::MotionError;
use crate::parallax::ParallaxError;
use crate::source::CaptureError;

/// A collaborator the operation needs was never bound.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigurationError {
    #[error("camera {camera} has no frame source")]
    MissingFrameSource { camera: String },
    #[error("camera {camera} suspends preview in tasks but has no machine bound")]
    MissingMachine { camera: String },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Everything a settle, focus or parallax operation can fail with.
///
/// Motion errors pass through unchanged; the caller owns retry policy.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Parallax(#[from] ParallaxError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
