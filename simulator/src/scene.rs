use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use frame_settle_common::config::SimulatorConfig;
use frame_settle_common::{Frame, PixelFormat};
use frame_settle_vision::motion::Movable;
use frame_settle_vision::source::{CaptureError, FrameSource};
use image::{imageops, GrayImage};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::head::SimulatedHead;

/// Radius of the raised feature centered on the world origin, mm.
const FEATURE_RADIUS_MM: f64 = 3.0;
/// Blur sigma per mm of defocus.
const BLUR_PER_MM: f64 = 2.5;

/// Optics the rendering needs besides the simulator section.
#[derive(Debug, Clone, Copy)]
pub struct Optics {
    pub units_per_pixel: f64,
    /// Z of the plane the units per pixel apply to.
    pub default_z: f64,
    /// Z of the perspective center.
    pub focal_point_z: f64,
}

/// Looks down at a textured board with one raised feature, from wherever
/// the [`SimulatedHead`] is.
pub struct SimulatedCamera {
    head: Arc<SimulatedHead>,
    config: SimulatorConfig,
    optics: Optics,
    rng: Mutex<StdRng>,
    seq: AtomicU64,
    last: Mutex<Option<Instant>>,
}

impl SimulatedCamera {
    pub fn new(head: Arc<SimulatedHead>, config: SimulatorConfig, optics: Optics) -> Self {
        Self {
            head,
            config,
            optics,
            rng: Mutex::new(StdRng::seed_from_u64(0x5e77_1e)),
            seq: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    /// Image scale of a plane at `z` relative to the calibrated plane.
    fn magnification(&self, z: f64) -> f64 {
        let zc = self.optics.focal_point_z;
        (self.optics.default_z - zc) / (z - zc)
    }

    fn board(wx: f64, wy: f64) -> f64 {
        110.0 + 50.0 * (wx * TAU / 1.7).sin() * (wy * TAU / 2.3).sin() + 20.0 * (wx * TAU / 0.9 + wy).cos()
    }

    fn feature(wx: f64, wy: f64) -> f64 {
        if (wx * 2.0).floor() as i64 % 2 == 0 {
            220.0 - 10.0 * wy
        } else {
            35.0 + 10.0 * wy
        }
    }

    fn render(&self) -> GrayImage {
        let (w, h) = (self.config.width, self.config.height);
        let at = self.head.location();
        let (vx, vy) = self.head.vibration();
        let upp = self.optics.units_per_pixel;
        let feature_scale = upp / self.magnification(self.config.feature_z);
        let mut img = GrayImage::new(w, h);
        for (x, y, px) in img.enumerate_pixels_mut() {
            let ix = x as f64 - w as f64 / 2.0 + vx;
            let iy = y as f64 - h as f64 / 2.0 + vy;
            let fx = at.x + ix * feature_scale;
            let fy = at.y + iy * feature_scale;
            let v = if fx.hypot(fy) < FEATURE_RADIUS_MM {
                Self::feature(fx, fy)
            } else {
                Self::board(at.x + ix * upp, at.y + iy * upp)
            };
            px.0[0] = v.round().clamp(0.0, 255.0) as u8;
        }
        let sigma = (BLUR_PER_MM * (at.z - self.config.focus_z).abs()) as f32;
        if sigma > 0.3 {
            img = imageops::blur(&img, sigma);
        }
        img
    }

    fn pace(&self) {
        let interval = Duration::from_millis(self.config.frame_interval_ms);
        let mut last = self.last.lock();
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < interval {
                std::thread::sleep(interval - since);
            }
        }
        *last = Some(Instant::now());
    }
}

impl FrameSource for SimulatedCamera {
    fn capture(&self) -> Result<Frame, CaptureError> {
        self.pace();
        let mut data = self.render().into_raw();
        if self.config.noise > 0.0 {
            let mut rng = self.rng.lock();
            let n = self.config.noise;
            for v in data.iter_mut() {
                *v = (*v as f64 + rng.random_range(-n..=n)).round().clamp(0.0, 255.0) as u8;
            }
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        Frame::new(
            self.config.width,
            self.config.height,
            PixelFormat::Gray8,
            data,
            Utc::now().timestamp_millis(),
            seq,
        )
        .map_err(|e| CaptureError::Device {
            device: "simulated".into(),
            reason: e.to_string(),
        })
    }

    fn resolution(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_settle_common::Location;
    use frame_settle_vision::focus::focus_score;

    fn camera(head: Arc<SimulatedHead>) -> SimulatedCamera {
        let config = SimulatorConfig {
            width: 96,
            height: 72,
            noise: 0.0,
            frame_interval_ms: 0,
            ..SimulatorConfig::default()
        };
        SimulatedCamera::new(
            head,
            config,
            Optics {
                units_per_pixel: 0.05,
                default_z: 0.0,
                focal_point_z: 60.0,
            },
        )
    }

    #[test]
    fn still_head_renders_identical_frames() {
        let head = Arc::new(SimulatedHead::new(0.0, 100.0));
        let camera = camera(head);
        let a = camera.capture().unwrap();
        let b = camera.capture().unwrap();
        assert_eq!(a.data(), b.data());
        assert_eq!(b.seq(), a.seq() + 1);
    }

    #[test]
    fn sharpest_at_focus_z() {
        let head = Arc::new(SimulatedHead::new(0.0, 100.0));
        let camera = camera(head.clone());
        let focus_z = SimulatorConfig::default().focus_z;
        head.move_to(Location::new(0.0, 0.0, focus_z, 0.0), None).unwrap();
        let sharp = focus_score(&camera.capture().unwrap(), 40);
        head.move_to(Location::new(0.0, 0.0, focus_z + 1.0, 0.0), None).unwrap();
        let blurred = focus_score(&camera.capture().unwrap(), 40);
        assert!(sharp > blurred, "{sharp} <= {blurred}");
    }
}
