//! Error types for AR sessions.

use frameslot_resources::ResourceError;
use frameslot_rhi::RhiError;
use thiserror::Error;

/// Error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The graphics device rejected a camera texture operation.
    #[error("Camera texture error: {0}")]
    Device(#[from] RhiError),

    /// The backdrop image could not be loaded.
    #[error("Backdrop error: {0}")]
    Backdrop(#[from] ResourceError),

    /// Rotation is not a multiple of 90 degrees.
    #[error("Invalid display rotation: {0} degrees")]
    InvalidRotation(u32),

    /// Display or camera size with a zero dimension.
    #[error("Invalid {what} size {width}x{height}")]
    InvalidSize {
        what: &'static str,
        width: u32,
        height: u32,
    },
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
