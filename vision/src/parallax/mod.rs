//! Part height from parallax: move the camera sideways, see how far a
//! feature moves in the image, triangulate against the camera's perspective
//! center.

pub mod matching;

use std::sync::Arc;
use std::time::Duration;

use frame_settle_common::config::ParallaxConfig;
use frame_settle_common::{Frame, Location};
use tracing::{debug, warn};

use crate::camera::Camera;
use crate::error::VisionError;
use crate::motion::Movable;
use crate::overlay::{DiagnosticOverlay, OverlayMarker};

pub use matching::{locate, Plane, ShotMatch};

const OVERLAY_DURATION: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParallaxError {
    #[error("feature size {size} does not fit a {width}x{height} frame")]
    TemplateTooLarge { size: u32, width: u32, height: u32 },
    #[error("feature template has no contrast")]
    FeaturelessTemplate,
    #[error("feature not found in the shifted frame")]
    NoMatch,
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),
}

/// Z of the camera's perspective center from two shift measurements: `p1`
/// at `low_z` and `p2` on top of a block of `block_height`.
pub fn calibrate_focal_point(low_z: f64, p1: f64, block_height: f64, p2: f64) -> Result<f64, ParallaxError> {
    if !(block_height > 0.0) {
        return Err(ParallaxError::InvalidCalibration(format!(
            "block height must be > 0, got {block_height}"
        )));
    }
    if !(p2 > p1) {
        return Err(ParallaxError::InvalidCalibration(format!(
            "shift on the block ({p2}) must exceed the shift below it ({p1})"
        )));
    }
    Ok(low_z + block_height * p2 / (p2 - p1))
}

/// Pixel-wise mean of same-sized frames. The first frame's metadata is kept.
fn average_frames(frames: &[Arc<Frame>]) -> Result<Frame, VisionError> {
    let first = &frames[0];
    if frames.len() == 1 {
        return Ok(first.as_ref().clone());
    }
    let mut sums = vec![0u32; first.data().len()];
    for frame in frames {
        if frame.data().len() != sums.len() {
            // geometry changed mid-average, use the latest frame alone
            return Ok(frame.as_ref().clone());
        }
        for (sum, &v) in sums.iter_mut().zip(frame.data()) {
            *sum += v as u32;
        }
    }
    let n = frames.len() as u32;
    let data = sums.into_iter().map(|s| ((s + n / 2) / n) as u8).collect();
    Ok(Frame::new(
        first.width(),
        first.height(),
        first.format(),
        data,
        first.captured_at_ms(),
        first.seq(),
    )?)
}

pub struct ParallaxHeightEstimator {
    config: ParallaxConfig,
}

impl ParallaxHeightEstimator {
    pub fn new(config: ParallaxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ParallaxConfig {
        &self.config
    }

    /// Settled, optionally averaged frame at the current location.
    fn shot(&self, camera: &Camera) -> Result<Frame, VisionError> {
        let mut frames = vec![camera.settle_and_capture()?.frame];
        for _ in 1..self.config.averaged_frames {
            frames.push(camera.capture()?);
        }
        average_frames(&frames)
    }

    /// Apparent shift in mm of the feature at the image center when the
    /// camera moves `shift_distance_mm` along X from `start`.
    ///
    /// The movable is back at `start` when this returns, also on failure.
    pub fn measure_parallax_shift(
        &self,
        camera: &Camera,
        movable: &dyn Movable,
        start: Location,
    ) -> Result<f64, VisionError> {
        let measured = self.measure_from(camera, movable, start);
        let restored = movable.move_to(start, None);
        match (measured, restored) {
            (Ok(shift), Ok(())) => Ok(shift),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Err(restore)) => {
                warn!(error = %restore, "failed to restore start location after parallax error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    fn measure_from(&self, camera: &Camera, movable: &dyn Movable, start: Location) -> Result<f64, VisionError> {
        let size = self.config.feature_size as usize;
        movable.move_to(start, None)?;
        let before = Plane::luma(&self.shot(camera)?);
        let template = before.center_crop(size)?;
        let (x0, y0) = before.center_origin(size);

        movable.move_to(start.with_x(start.x + self.config.shift_distance_mm), None)?;
        let shifted = self.shot(camera)?;
        let found = locate(&Plane::luma(&shifted), &template, self.config.max_subpixel_offset)?;

        let (ux, uy) = camera.units_per_pixel();
        let dx = found.x - x0 as f64;
        let dy = found.y - y0 as f64;
        let shift = (dx * ux).hypot(dy * uy);
        debug!(dx, dy, score = found.score, shift, "parallax match");

        if self.config.show_diagnostics {
            let half = size as f64 / 2.0;
            camera.show_overlay(
                DiagnosticOverlay::new(
                    Arc::new(shifted),
                    format!("Parallax shift {shift:.3} mm"),
                    OVERLAY_DURATION,
                )
                .with_marker(OverlayMarker::Square {
                    cx: found.x + half,
                    cy: found.y + half,
                    size: size as f64,
                }),
            );
        }
        Ok(shift)
    }

    /// `location` with Z replaced by the triangulated height of the feature
    /// under the camera. A vanishing shift leaves `location` unchanged.
    pub fn auto_focus(&self, camera: &Camera, movable: &dyn Movable, location: Location) -> Result<Location, VisionError> {
        let measured = self.measure_parallax_shift(camera, movable, location)?;
        if measured.abs() < 1e-9 {
            warn!(camera = camera.name(), "no parallax shift measured, keeping Z");
            return Ok(location);
        }
        let zc = self.config.focal_point_z;
        let z = zc + self.config.shift_distance_mm * (camera.default_z() - zc) / measured;
        debug!(measured, z, "parallax height");
        Ok(location.with_z(z))
    }
}

#[cfg(test)]
mod tests {
    use super::matching::tests::blob;
    use super::*;
    use crate::motion::MotionError;
    use crate::source::{CaptureError, FrameSource};
    use frame_settle_common::config::{SettleConfig, SettleMethod};
    use frame_settle_common::PixelFormat;
    use parking_lot::Mutex;

    const UPP: f64 = 0.1;

    struct Gantry {
        at: Mutex<Location>,
        fail_shift: bool,
    }

    impl Movable for Gantry {
        fn move_to(&self, location: Location, _speed: Option<f64>) -> Result<(), MotionError> {
            let mut at = self.at.lock();
            if self.fail_shift && location.x != at.x {
                return Err(MotionError::NotReady("x axis not homed".into()));
            }
            *at = location;
            Ok(())
        }

        fn location(&self) -> Location {
            *self.at.lock()
        }
    }

    /// Perspective camera looking down from `zc` at a spot of height
    /// `feature_z`; calibrated at Z 0.
    struct Scene {
        gantry: Arc<Gantry>,
        zc: f64,
        feature_z: f64,
    }

    impl FrameSource for Scene {
        fn capture(&self) -> Result<Frame, CaptureError> {
            let magnify = (0.0 - self.zc) / (self.feature_z - self.zc);
            let offset = -self.gantry.location().x * magnify / UPP;
            Ok(blob(80, 48, 40.0 + offset, 24.0))
        }

        fn resolution(&self) -> (u32, u32) {
            (80, 48)
        }
    }

    fn rig(fail_shift: bool) -> (Arc<Gantry>, Camera) {
        let gantry = Arc::new(Gantry {
            at: Mutex::new(Location::ORIGIN),
            fail_shift,
        });
        let camera = Camera::builder("parallax")
            .source(Arc::new(Scene {
                gantry: gantry.clone(),
                zc: 50.0,
                feature_z: 5.0,
            }))
            .units_per_pixel(UPP, UPP)
            .settle(SettleConfig {
                method: Some(SettleMethod::FixedTime),
                time_ms: 0,
                ..SettleConfig::default()
            })
            .build()
            .unwrap();
        (gantry, camera)
    }

    fn estimator() -> ParallaxHeightEstimator {
        ParallaxHeightEstimator::new(ParallaxConfig {
            shift_distance_mm: 2.0,
            feature_size: 20,
            focal_point_z: 50.0,
            ..ParallaxConfig::default()
        })
    }

    #[test]
    fn triangulates_feature_height() {
        let (gantry, camera) = rig(false);
        let start = Location::new(0.0, 0.0, 0.0, 0.0);
        let found = estimator().auto_focus(&camera, gantry.as_ref(), start).unwrap();
        assert!((found.z - 5.0).abs() < 0.05, "{found}");
        assert_eq!(gantry.location(), start);
    }

    #[test]
    fn shift_on_the_calibration_plane_equals_the_move() {
        let (gantry, camera) = rig(false);
        let shift = estimator()
            .measure_parallax_shift(&camera, gantry.as_ref(), Location::ORIGIN)
            .unwrap();
        // the feature at Z 5 looks 50/45 times closer than Z 0
        assert!((shift - 2.0 * 50.0 / 45.0).abs() < 0.01, "{shift}");
    }

    #[test]
    fn motion_error_propagates_and_start_is_restored() {
        let (gantry, camera) = rig(true);
        let start = Location::ORIGIN;
        let err = estimator()
            .measure_parallax_shift(&camera, gantry.as_ref(), start)
            .unwrap_err();
        assert!(matches!(err, VisionError::Motion(MotionError::NotReady(_))));
        assert_eq!(gantry.location(), start);
    }

    #[test]
    fn zero_shift_keeps_location() {
        // a flat-topped scene that never moves
        struct Still;
        impl FrameSource for Still {
            fn capture(&self) -> Result<Frame, CaptureError> {
                Ok(blob(80, 48, 40.0, 24.0))
            }
            fn resolution(&self) -> (u32, u32) {
                (80, 48)
            }
        }
        let gantry = Gantry {
            at: Mutex::new(Location::ORIGIN),
            fail_shift: false,
        };
        let camera = Camera::builder("still")
            .source(Arc::new(Still))
            .settle(SettleConfig {
                method: Some(SettleMethod::FixedTime),
                time_ms: 0,
                ..SettleConfig::default()
            })
            .build()
            .unwrap();
        let location = Location::new(1.0, 2.0, -3.0, 0.0);
        let found = estimator().auto_focus(&camera, &gantry, location).unwrap();
        assert_eq!(found, location);
    }

    #[test]
    fn oversized_feature_is_an_error() {
        let (gantry, camera) = rig(false);
        let estimator = ParallaxHeightEstimator::new(ParallaxConfig {
            feature_size: 64,
            ..ParallaxConfig::default()
        });
        let err = estimator
            .measure_parallax_shift(&camera, gantry.as_ref(), Location::ORIGIN)
            .unwrap_err();
        assert!(matches!(
            err,
            VisionError::Parallax(ParallaxError::TemplateTooLarge { .. })
        ));
    }

    #[test]
    fn focal_point_calibration() {
        let zc = calibrate_focal_point(0.0, 2.0, 5.0, 2.0 * 50.0 / 45.0).unwrap();
        assert!((zc - 50.0).abs() < 1e-9);
        assert!(calibrate_focal_point(0.0, 2.0, 5.0, 2.0).is_err());
        assert!(calibrate_focal_point(0.0, 2.0, 0.0, 3.0).is_err());
    }

    #[test]
    fn averaging_rounds_to_nearest() {
        let a = Arc::new(Frame::filled(2, 2, PixelFormat::Gray8, 10));
        let b = Arc::new(Frame::filled(2, 2, PixelFormat::Gray8, 13));
        let avg = average_frames(&[a, b]).unwrap();
        assert!(avg.data().iter().all(|&v| v == 12));
    }
}
