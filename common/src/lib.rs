pub mod config;
pub mod frame;
pub mod location;

pub use frame::{Frame, FrameError, PixelFormat};
pub use location::Location;
