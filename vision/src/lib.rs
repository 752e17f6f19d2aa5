//! Camera acquisition, settle detection, preview broadcasting, auto focus and
//! parallax height measurement.
//!
//! The machine and the UI are collaborators behind the traits in [`source`],
//! [`motion`] and [`overlay`]; this crate never moves anything itself.

pub mod broadcast;
pub mod camera;
pub mod error;
pub mod focus;
pub mod motion;
pub mod overlay;
pub mod parallax;
pub mod recorder;
pub mod settle;
pub mod source;
pub mod switcher;
pub mod transform;

pub use camera::{machine_targeted_user_action, Camera, CameraBuilder};
pub use error::{ConfigurationError, VisionError};
pub use frame_settle_common::{Frame, Location, PixelFormat};
