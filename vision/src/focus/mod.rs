//! Auto focus: sweep a movable through a range, score sharpness, narrow
//! the range around the sharpest sample and repeat.

pub mod sharpness;

use std::sync::Arc;
use std::time::Duration;

use frame_settle_common::config::FocusConfig;
use frame_settle_common::{Frame, Location};
use tracing::{debug, trace};

use crate::camera::Camera;
use crate::error::{ConfigurationError, VisionError};
use crate::motion::Movable;
use crate::overlay::DiagnosticOverlay;

pub use sharpness::{focus_score, focus_score_marked};

/// Most samples per pass.
const MAX_CURVE_STEPS: usize = 11;
const PROBE_OVERLAY_DURATION: Duration = Duration::from_millis(1000);
const BEST_OVERLAY_DURATION: Duration = Duration::from_millis(2000);

/// One sample of a focus curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusCurvePoint {
    pub location: Location,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct FocusOutcome {
    pub best: Location,
    /// One curve per pass, coarse to fine.
    pub passes: Vec<Vec<FocusCurvePoint>>,
}

/// Pixel diameter covering a subject of `subject_max_size` mm, kept 50 px
/// away from the frame edges and even.
pub fn sample_diameter(subject_max_size: f64, units_per_pixel: (f64, f64), resolution: (u32, u32)) -> u32 {
    let (ux, uy) = units_per_pixel;
    let (w, h) = resolution;
    let d = (subject_max_size / ux).max(subject_max_size / uy).ceil().max(0.0) as u32;
    let d = d.min(h.saturating_sub(50)).min(w.saturating_sub(50));
    sharpness::clamp_diameter(d, w, h)
}

/// Samples in a pass over `length` mm: one per resolution unit, 2 to 11.
pub fn curve_steps(length: f64, focal_resolution: f64) -> usize {
    let n = 1.0 + (length / focal_resolution).round();
    if n.is_nan() {
        return 2;
    }
    n.clamp(2.0, MAX_CURVE_STEPS as f64) as usize
}

pub struct FocusSearch {
    config: FocusConfig,
}

impl FocusSearch {
    pub fn new(config: FocusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FocusConfig {
        &self.config
    }

    /// Best focus location between `location0` and `location1`.
    ///
    /// Motion errors are returned unchanged. Otherwise the search always
    /// ends with a best guess, ties going to the earlier sample.
    pub fn auto_focus(
        &self,
        camera: &Camera,
        movable: &dyn Movable,
        subject_max_size: f64,
        location0: Location,
        location1: Location,
    ) -> Result<Location, VisionError> {
        self.search(camera, movable, subject_max_size, location0, location1)
            .map(|outcome| outcome.best)
    }

    /// [`FocusSearch::auto_focus`] with the focus curve of every pass.
    pub fn search(
        &self,
        camera: &Camera,
        movable: &dyn Movable,
        subject_max_size: f64,
        location0: Location,
        location1: Location,
    ) -> Result<FocusOutcome, VisionError> {
        let resolution = self.config.focal_resolution_mm;
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(ConfigurationError::InvalidParameter(format!(
                "focal resolution must be a positive distance, got {resolution} mm"
            ))
            .into());
        }
        let diameter = sample_diameter(subject_max_size, camera.units_per_pixel(), camera.resolution()?);
        let mut best_image: Option<Frame> = None;
        let result = self.run_passes(camera, movable, diameter, location0, location1, &mut best_image);
        if let Some(image) = best_image {
            camera.show_overlay(DiagnosticOverlay::new(
                Arc::new(image),
                "Auto Focus \u{26AB}",
                BEST_OVERLAY_DURATION,
            ));
        }
        result
    }

    fn run_passes(
        &self,
        camera: &Camera,
        movable: &dyn Movable,
        diameter: u32,
        mut location0: Location,
        mut location1: Location,
        best_image: &mut Option<Frame>,
    ) -> Result<FocusOutcome, VisionError> {
        let resolution = self.config.focal_resolution_mm;
        let speed = Some(self.config.focus_speed);
        // Approach from a retracted location to take up backlash.
        let retract = location1.unit_vector_to(&location0) * self.config.retract_mm;
        let mut retracted = location0 + retract;

        location0 = movable.approximate_location(location0, location0);
        location1 = movable.approximate_location(location1, location1);
        retracted = movable.approximate_location(retracted, location0);
        movable.move_to(retracted, None)?;

        let mut passes = Vec::new();
        loop {
            let steps = curve_steps(location1.xyz_distance_to(&location0), resolution);
            let step = (location1 - location0) * (1.0 / (steps - 1) as f64);
            let mut curve = Vec::with_capacity(steps);
            let mut best: Option<usize> = None;

            for i in 0..steps {
                let location = location0 + step * i as f64;
                movable.move_to(location, speed)?;
                let settled = camera.settle_and_capture()?;
                let (mut score, marked) = if self.config.show_diagnostics {
                    let (score, marked) = focus_score_marked(&settled.frame, diameter);
                    (score, Some(marked))
                } else {
                    (focus_score(&settled.frame, diameter), None)
                };
                for _ in 1..self.config.averaged_frames {
                    score += focus_score(&*camera.capture()?, diameter);
                }
                curve.push(FocusCurvePoint { location, score });

                let improved = best.map_or(true, |b| curve[b].score < score);
                if improved {
                    best = Some(i);
                    if let Some(marked) = &marked {
                        *best_image = Some(marked.clone());
                    }
                }
                if let Some(marked) = marked {
                    let caption = if improved { "Auto Focus ▲" } else { "Auto Focus ▼" };
                    camera.show_overlay(DiagnosticOverlay::new(
                        Arc::new(marked),
                        caption,
                        PROBE_OVERLAY_DURATION,
                    ));
                }
                trace!(%location, score, step = step.xyz_length(), "focus probe");
            }

            let best = best.unwrap_or(0);
            debug!(
                pass = passes.len(),
                steps,
                best = %curve[best].location,
                score = curve[best].score,
                "focus pass done"
            );
            passes.push(curve);

            if step.xyz_length() / resolution < 1.5 {
                let location = location0 + step * best as f64;
                movable.move_to(location, speed)?;
                return Ok(FocusOutcome {
                    best: location,
                    passes,
                });
            }

            // Keep one sample of margin on each side of the next range.
            let next = (best as f64).clamp(1.0, (steps - 2) as f64);
            let old0 = location0;
            location0 = old0 + step * (next - 1.0);
            location1 = old0 + step * (next + 1.0);
            retracted = location0 + retract;

            location0 = movable.approximate_location(location0, location0);
            location1 = movable.approximate_location(location1, location1);
            retracted = movable.approximate_location(retracted, retracted);
            movable.move_to(retracted, None)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::MotionError;
    use crate::source::{CaptureError, FrameSource};
    use frame_settle_common::config::{SettleConfig, SettleMethod};
    use frame_settle_common::PixelFormat;
    use parking_lot::Mutex;

    /// A Z axis with optional soft limits and a move log.
    struct Axis {
        at: Mutex<Location>,
        moves: Mutex<Vec<Location>>,
        fail_after: Option<usize>,
    }

    impl Axis {
        fn new() -> Arc<Self> {
            Self::failing_after(None)
        }

        fn failing_after(fail_after: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                at: Mutex::new(Location::ORIGIN),
                moves: Mutex::new(Vec::new()),
                fail_after,
            })
        }
    }

    impl Movable for Axis {
        fn move_to(&self, location: Location, _speed: Option<f64>) -> Result<(), MotionError> {
            let mut moves = self.moves.lock();
            if self.fail_after.is_some_and(|n| moves.len() >= n) {
                return Err(MotionError::MoveFailed {
                    target: location,
                    reason: "limit switch".into(),
                });
            }
            moves.push(location);
            *self.at.lock() = location;
            Ok(())
        }

        fn location(&self) -> Location {
            *self.at.lock()
        }
    }

    /// Stripes whose contrast falls off exponentially with defocus.
    struct Optics {
        axis: Arc<Axis>,
        focus_z: f64,
    }

    impl FrameSource for Optics {
        fn capture(&self) -> Result<Frame, CaptureError> {
            let dz = (self.axis.location().z - self.focus_z).abs();
            let contrast = 200.0 * (-2.0 * dz).exp();
            let hi = (128.0 + contrast / 2.0).round() as u8;
            let lo = (128.0 - contrast / 2.0).round() as u8;
            let data = (0..100 * 100)
                .map(|i| if (i % 100) % 4 < 2 { hi } else { lo })
                .collect();
            Ok(Frame::new(100, 100, PixelFormat::Gray8, data, 0, 0).unwrap())
        }

        fn resolution(&self) -> (u32, u32) {
            (100, 100)
        }
    }

    fn camera_on(axis: Arc<Axis>, focus_z: f64) -> Camera {
        Camera::builder("focus")
            .source(Arc::new(Optics { axis, focus_z }))
            .units_per_pixel(0.05, 0.05)
            .settle(SettleConfig {
                method: Some(SettleMethod::FixedTime),
                time_ms: 0,
                ..SettleConfig::default()
            })
            .build()
            .unwrap()
    }

    fn search() -> FocusSearch {
        FocusSearch::new(FocusConfig {
            show_diagnostics: false,
            ..FocusConfig::default()
        })
    }

    #[test]
    fn converges_to_known_peak() {
        let axis = Axis::new();
        let camera = camera_on(axis.clone(), 0.37);
        let outcome = search()
            .search(
                &camera,
                axis.as_ref(),
                2.0,
                Location::new(0.0, 0.0, -2.0, 0.0),
                Location::new(0.0, 0.0, 2.0, 0.0),
            )
            .unwrap();
        assert!((outcome.best.z - 0.37).abs() <= 0.05, "{}", outcome.best);
        // log2(4 / 0.05) bounds the pass count
        assert!(outcome.passes.len() <= 7);
        assert_eq!(outcome.passes[0].len(), 11);
        // the search ends parked on the result
        assert_eq!(axis.location(), outcome.best);
    }

    #[test]
    fn first_move_is_retracted_beyond_start() {
        let axis = Axis::new();
        let camera = camera_on(axis.clone(), 0.0);
        search()
            .auto_focus(
                &camera,
                axis.as_ref(),
                2.0,
                Location::new(0.0, 0.0, -1.0, 0.0),
                Location::new(0.0, 0.0, 1.0, 0.0),
            )
            .unwrap();
        let first = axis.moves.lock()[0];
        assert!((first.z - -2.0).abs() < 1e-9);
    }

    #[test]
    fn motion_errors_propagate() {
        let axis = Axis::failing_after(Some(3));
        let camera = camera_on(axis.clone(), 0.0);
        let err = search()
            .auto_focus(
                &camera,
                axis.as_ref(),
                2.0,
                Location::new(0.0, 0.0, -1.0, 0.0),
                Location::new(0.0, 0.0, 1.0, 0.0),
            )
            .unwrap_err();
        assert!(matches!(err, VisionError::Motion(MotionError::MoveFailed { .. })));
    }

    #[test]
    fn tied_scores_keep_the_first_sample() {
        // a flat scene scores the same everywhere
        struct Flat;
        impl FrameSource for Flat {
            fn capture(&self) -> Result<Frame, CaptureError> {
                Ok(Frame::filled(100, 100, PixelFormat::Gray8, 50))
            }
            fn resolution(&self) -> (u32, u32) {
                (100, 100)
            }
        }
        let axis = Axis::new();
        let camera = Camera::builder("flat")
            .source(Arc::new(Flat))
            .settle(SettleConfig {
                method: Some(SettleMethod::FixedTime),
                time_ms: 0,
                ..SettleConfig::default()
            })
            .build()
            .unwrap();
        let outcome = search()
            .search(
                &camera,
                axis.as_ref(),
                1.0,
                Location::new(0.0, 0.0, 0.0, 0.0),
                Location::new(0.0, 0.0, 0.1, 0.0),
            )
            .unwrap();
        assert_eq!(outcome.passes.len(), 1);
        assert_eq!(outcome.best.z, 0.0);
    }

    #[test]
    fn each_sample_is_shown_when_diagnostics_on() {
        let axis = Axis::new();
        let captions = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = {
            let captions = captions.clone();
            move |o: DiagnosticOverlay| captions.lock().push(o.caption)
        };
        let camera = Camera::builder("diag")
            .source(Arc::new(Optics {
                axis: axis.clone(),
                focus_z: 0.0,
            }))
            .settle(SettleConfig {
                method: Some(SettleMethod::FixedTime),
                time_ms: 0,
                ..SettleConfig::default()
            })
            .overlay_sink(Arc::new(sink))
            .build()
            .unwrap();
        FocusSearch::new(FocusConfig::default())
            .auto_focus(
                &camera,
                axis.as_ref(),
                2.0,
                Location::new(0.0, 0.0, -0.05, 0.0),
                Location::new(0.0, 0.0, 0.05, 0.0),
            )
            .unwrap();
        let captions = captions.lock();
        assert_eq!(captions[0], "Auto Focus ▲");
        assert_eq!(captions.last().map(String::as_str), Some("Auto Focus \u{26AB}"));
    }

    #[test]
    fn step_count_bounds() {
        assert_eq!(curve_steps(4.0, 0.05), 11);
        assert_eq!(curve_steps(0.0, 0.05), 2);
        assert_eq!(curve_steps(0.16, 0.05), 4);
    }

    #[test]
    fn diameter_from_subject_size() {
        assert_eq!(sample_diameter(2.0, (0.05, 0.04), (200, 200)), 50);
        // kept 50 px from the frame edge
        assert_eq!(sample_diameter(10.0, (0.05, 0.05), (120, 100)), 50);
    }

    #[test]
    fn zero_focal_resolution_is_rejected_before_moving() {
        for resolution in [0.0, -0.1, f64::NAN] {
            let axis = Axis::new();
            let camera = camera_on(axis.clone(), 0.0);
            let err = FocusSearch::new(FocusConfig {
                focal_resolution_mm: resolution,
                show_diagnostics: false,
                ..FocusConfig::default()
            })
            .auto_focus(
                &camera,
                axis.as_ref(),
                2.0,
                Location::new(0.0, 0.0, -1.0, 0.0),
                Location::new(0.0, 0.0, 1.0, 0.0),
            )
            .unwrap_err();
            assert!(matches!(
                err,
                VisionError::Configuration(ConfigurationError::InvalidParameter(_))
            ));
            assert!(axis.moves.lock().is_empty());
        }
    }

    #[test]
    fn degenerate_step_counts_stay_bounded() {
        assert_eq!(curve_steps(4.0, 0.0), MAX_CURVE_STEPS);
        assert_eq!(curve_steps(0.0, 0.0), 2);
        assert_eq!(curve_steps(f64::INFINITY, 0.1), MAX_CURVE_STEPS);
    }
}
