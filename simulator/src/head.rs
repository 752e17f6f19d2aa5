use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use frame_settle_common::Location;
use frame_settle_vision::motion::{MachineState, Movable, MotionError};
use parking_lot::Mutex;
use tracing::trace;

/// Ring-down frequency of the simulated gantry.
const VIBRATION_HZ: f64 = 18.0;

struct Motion {
    at: Location,
    moved_at: Instant,
    /// Initial amplitude of the last move's ring-down, pixels.
    amplitude: f64,
}

/// A camera head that teleports and then rings down like a real gantry.
pub struct SimulatedHead {
    motion: Mutex<Motion>,
    busy: AtomicBool,
    vibration_px: f64,
    decay_ms: f64,
}

impl SimulatedHead {
    pub fn new(vibration_px: f64, decay_ms: f64) -> Self {
        Self {
            motion: Mutex::new(Motion {
                at: Location::ORIGIN,
                moved_at: Instant::now(),
                amplitude: 0.0,
            }),
            busy: AtomicBool::new(false),
            vibration_px,
            decay_ms: decay_ms.max(1.0),
        }
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Current vibration displacement in pixels.
    pub fn vibration(&self) -> (f64, f64) {
        let motion = self.motion.lock();
        let t_ms = motion.moved_at.elapsed().as_secs_f64() * 1000.0;
        let envelope = motion.amplitude * (-t_ms / self.decay_ms).exp();
        let phase = TAU * VIBRATION_HZ * t_ms / 1000.0;
        (envelope * phase.sin(), 0.5 * envelope * phase.cos())
    }
}

impl Movable for SimulatedHead {
    fn move_to(&self, location: Location, _speed: Option<f64>) -> Result<(), MotionError> {
        if !(location.x.is_finite() && location.y.is_finite() && location.z.is_finite()) {
            return Err(MotionError::MoveFailed {
                target: location,
                reason: "non-finite coordinate".into(),
            });
        }
        let mut motion = self.motion.lock();
        let distance = motion.at.xyz_distance_to(&location);
        // longer moves ring harder, saturating at the configured amplitude
        motion.amplitude = self.vibration_px * (distance / 5.0).min(1.0);
        motion.at = location;
        motion.moved_at = Instant::now();
        trace!(%location, amplitude = motion.amplitude, "head moved");
        Ok(())
    }

    fn location(&self) -> Location {
        self.motion.lock().at
    }
}

impl MachineState for SimulatedHead {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vibration_decays() {
        let head = SimulatedHead::new(6.0, 1.0);
        head.move_to(Location::new(10.0, 0.0, 0.0, 0.0), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(40));
        let (x, y) = head.vibration();
        assert!(x.abs() < 0.01 && y.abs() < 0.01);
    }

    #[test]
    fn short_moves_ring_less() {
        let head = SimulatedHead::new(6.0, 1000.0);
        head.move_to(Location::new(0.5, 0.0, 0.0, 0.0), None).unwrap();
        assert!((head.motion.lock().amplitude - 0.6).abs() < 1e-9);
        assert_eq!(head.location().x, 0.5);
    }

    #[test]
    fn rejects_nan_target() {
        let head = SimulatedHead::new(6.0, 100.0);
        assert!(head.move_to(Location::new(f64::NAN, 0.0, 0.0, 0.0), None).is_err());
    }
}
