use frame_settle_common::Frame;

/// Abstracts a physical or simulated camera device.
///
/// Implementations are called from the caller's thread for settle/focus
/// work and from the preview thread for broadcasting, so they must be
/// `Send + Sync` and do their own locking if the device needs it.
pub trait FrameSource: Send + Sync {
    /// Acquire device resources. Called once per capture session.
    fn open(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Release device resources. Must tolerate being called when not open.
    fn close(&self) {}

    /// Produce the next frame, blocking until one is available.
    fn capture(&self) -> Result<Frame, CaptureError>;

    /// Whether a frame newer than the last captured one is available.
    /// Sources that cannot tell report `true`.
    fn has_new_frame(&self) -> bool {
        true
    }

    /// Native (untransformed) frame size.
    fn resolution(&self) -> (u32, u32);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    #[error("device {device} produced no frame")]
    NoFrame { device: String },
    #[error("device {device} failed: {reason}")]
    Device { device: String, reason: String },
    #[error("device {device} could not be opened: {reason}")]
    Open { device: String, reason: String },
    #[error("switcher {switcher} failed to select channel {channel}: {reason}")]
    Switch {
        switcher: String,
        channel: usize,
        reason: String,
    },
}
