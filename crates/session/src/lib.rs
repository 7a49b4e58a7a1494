//! AR session interface.
//!
//! The renderer consumes camera frames through the narrow [`ArSession`] and
//! [`ArFrame`] traits. [`SyntheticSession`] implements them without any
//! tracking hardware, drawing a deterministic camera image into a device
//! texture every update.

mod error;
mod frame;
mod synthetic;

pub use error::{SessionError, SessionResult};
pub use frame::{ArFrame, DisplayRotation, SyntheticFrame};
pub use synthetic::SyntheticSession;

/// Source of camera frames.
pub trait ArSession {
    type Frame: ArFrame;

    /// Advances the session and returns the latest camera frame.
    fn update(&mut self) -> SessionResult<Self::Frame>;
}
