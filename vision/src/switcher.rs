//! Several logical cameras sharing one capture device through an analog
//! video multiplexer.

use std::sync::Arc;
use std::time::Duration;

use frame_settle_common::config::SwitcherConfig;
use frame_settle_common::Frame;
use parking_lot::Mutex;
use tracing::debug;

use crate::motion::MotionError;
use crate::source::{CaptureError, FrameSource};

/// The machine actuator that drives the multiplexer.
pub trait SwitchActuator: Send + Sync {
    fn select(&self, channel: usize) -> Result<(), MotionError>;
}

impl<F> SwitchActuator for F
where
    F: Fn(usize) -> Result<(), MotionError> + Send + Sync,
{
    fn select(&self, channel: usize) -> Result<(), MotionError> {
        self(channel)
    }
}

/// One multiplexer and its current selection, shared by every
/// [`SwitchedSource`] wired to it.
pub struct SwitcherBank {
    name: String,
    actuator: Arc<dyn SwitchActuator>,
    delay: Duration,
    /// Held across switch and capture so channels never interleave.
    selection: Mutex<Option<usize>>,
}

impl SwitcherBank {
    pub fn new(name: impl Into<String>, actuator: Arc<dyn SwitchActuator>, config: &SwitcherConfig) -> Self {
        Self {
            name: name.into(),
            actuator,
            delay: Duration::from_millis(config.switch_delay_ms),
            selection: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selected(&self) -> Option<usize> {
        *self.selection.lock()
    }

    /// Run `f` with `channel` selected, switching and waiting for the
    /// signal first if another channel is active.
    pub fn with_channel<T>(
        &self,
        channel: usize,
        f: impl FnOnce() -> Result<T, CaptureError>,
    ) -> Result<T, CaptureError> {
        let mut selection = self.selection.lock();
        if *selection != Some(channel) {
            debug!(switcher = %self.name, from = ?*selection, to = channel, "switching channel");
            // unknown after a failed switch
            *selection = None;
            self.actuator.select(channel).map_err(|e| CaptureError::Switch {
                switcher: self.name.clone(),
                channel,
                reason: e.to_string(),
            })?;
            *selection = Some(channel);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }
        f()
    }
}

/// A logical camera on one channel of a [`SwitcherBank`].
pub struct SwitchedSource {
    bank: Arc<SwitcherBank>,
    channel: usize,
    device: Arc<dyn FrameSource>,
}

impl SwitchedSource {
    pub fn new(bank: Arc<SwitcherBank>, channel: usize, device: Arc<dyn FrameSource>) -> Self {
        Self {
            bank,
            channel,
            device,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }
}

impl FrameSource for SwitchedSource {
    fn open(&self) -> Result<(), CaptureError> {
        self.device.open()
    }

    fn close(&self) {
        self.device.close()
    }

    fn capture(&self) -> Result<Frame, CaptureError> {
        self.bank.with_channel(self.channel, || self.device.capture())
    }

    fn has_new_frame(&self) -> bool {
        // frames of another channel may be pending on the shared device
        self.bank.selected() != Some(self.channel) || self.device.has_new_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        self.device.resolution()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_settle_common::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports the multiplexer channel as the pixel value.
    struct Mux {
        channel: Arc<AtomicUsize>,
    }

    impl FrameSource for Mux {
        fn capture(&self) -> Result<Frame, CaptureError> {
            let v = self.channel.load(Ordering::SeqCst) as u8;
            Ok(Frame::filled(2, 2, PixelFormat::Gray8, v))
        }

        fn resolution(&self) -> (u32, u32) {
            (2, 2)
        }
    }

    fn bank(switches: Arc<AtomicUsize>, channel: Arc<AtomicUsize>) -> Arc<SwitcherBank> {
        let actuator = move |c: usize| -> Result<(), MotionError> {
            switches.fetch_add(1, Ordering::SeqCst);
            channel.store(c, Ordering::SeqCst);
            Ok(())
        };
        Arc::new(SwitcherBank::new(
            "mux",
            Arc::new(actuator),
            &SwitcherConfig { switch_delay_ms: 0 },
        ))
    }

    #[test]
    fn each_camera_sees_its_own_channel() {
        let switches = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(AtomicUsize::new(99));
        let bank = bank(switches.clone(), channel.clone());
        let device: Arc<dyn FrameSource> = Arc::new(Mux { channel });
        let top = SwitchedSource::new(bank.clone(), 1, device.clone());
        let bottom = SwitchedSource::new(bank.clone(), 2, device);

        assert_eq!(top.capture().unwrap().data()[0], 1);
        assert_eq!(top.capture().unwrap().data()[0], 1);
        assert_eq!(switches.load(Ordering::SeqCst), 1);

        assert_eq!(bottom.capture().unwrap().data()[0], 2);
        assert_eq!(top.capture().unwrap().data()[0], 1);
        assert_eq!(switches.load(Ordering::SeqCst), 3);
        assert_eq!(bank.selected(), Some(1));
    }

    #[test]
    fn failed_switch_is_a_capture_error() {
        let actuator = |_: usize| -> Result<(), MotionError> {
            Err(MotionError::Actuator {
                actuator: "mux".into(),
                reason: "relay stuck".into(),
            })
        };
        let bank = Arc::new(SwitcherBank::new("mux", Arc::new(actuator), &SwitcherConfig::default()));
        let source = SwitchedSource::new(
            bank.clone(),
            3,
            Arc::new(Mux {
                channel: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let err = source.capture().unwrap_err();
        assert!(matches!(err, CaptureError::Switch { channel: 3, .. }));
        assert_eq!(bank.selected(), None);
    }

    #[test]
    fn switching_waits_for_the_signal() {
        let bank = SwitcherBank::new(
            "slow",
            Arc::new(|_: usize| -> Result<(), MotionError> { Ok(()) }),
            &SwitcherConfig { switch_delay_ms: 30 },
        );
        let started = std::time::Instant::now();
        bank.with_channel(0, || Ok::<_, CaptureError>(())).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        let again = std::time::Instant::now();
        bank.with_channel(0, || Ok::<_, CaptureError>(())).unwrap();
        assert!(again.elapsed() < Duration::from_millis(30));
    }
}
