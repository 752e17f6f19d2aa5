use frame_settle_common::Location;

/// How long `wait_for_completion` waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    /// Motion commands have been sent to the controller.
    CommandJog,
    /// The controller reports the motion as finished.
    WaitForStillstand,
}

/// Something the machine can move: a camera, a nozzle, an actuator axis.
///
/// Motion planning lives entirely behind this trait. Every method may block
/// and every failure is handed back to the caller unchanged.
pub trait Movable: Send + Sync {
    /// Move to `location`. `speed` is a fraction of the nominal speed,
    /// `None` for the default.
    fn move_to(&self, location: Location, speed: Option<f64>) -> Result<(), MotionError>;

    fn location(&self) -> Location;

    fn wait_for_completion(&self, _completion: CompletionType) -> Result<(), MotionError> {
        Ok(())
    }

    /// The closest reachable location to `target`, e.g. after applying soft
    /// limits. `current` tells the motion layer which axes are in use.
    fn approximate_location(&self, target: Location, _current: Location) -> Location {
        target
    }
}

/// Machine-wide state the camera consults.
pub trait MachineState: Send + Sync {
    /// `true` while the machine runs a task.
    fn is_busy(&self) -> bool;

    fn wait_for_completion(&self, _completion: CompletionType) -> Result<(), MotionError> {
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MotionError {
    #[error("move to {target} failed: {reason}")]
    MoveFailed { target: Location, reason: String },
    #[error("machine not ready: {0}")]
    NotReady(String),
    #[error("actuator {actuator} failed: {reason}")]
    Actuator { actuator: String, reason: String },
}
