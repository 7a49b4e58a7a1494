//! Renderer error types.

use frameslot_rhi::RhiError;
use thiserror::Error;

use crate::pool::SlotState;

/// Errors raised by the slot pools and the components built on them.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Every slot is in use; the pool is smaller than the caller's concurrency
    #[error("No free slot available in a pool of {capacity}")]
    PoolExhausted { capacity: usize },

    /// A slot index outside the pool
    #[error("Slot {index} is out of range for a pool of {capacity}")]
    InvalidSlot { index: usize, capacity: usize },

    /// A slot was used in a state its protocol does not allow
    #[error("Cannot {operation} slot {index} while it is {actual:?}")]
    UnexpectedState {
        index: usize,
        actual: SlotState,
        operation: &'static str,
    },

    /// A new readback was submitted before the previous one was harvested
    #[error("Slot {0} holds a readback result that has not been harvested")]
    ResultPending(usize),

    /// An image has the wrong format or size for the operation
    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),

    /// Construction parameters are out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Recording or submitting failed after a swapchain image was acquired
    #[error("Frame {frame} abandoned after acquiring its image: {source}")]
    FrameAbandoned {
        frame: u64,
        #[source]
        source: Box<RenderError>,
    },

    /// Graphics device error
    #[error(transparent)]
    Rhi(#[from] RhiError),
}

impl RenderError {
    /// Returns true if the error must stop the render loop.
    ///
    /// Protocol violations, fence timeouts and device errors are fatal.
    /// Only transient device errors (an out-of-date swapchain) are not.
    pub fn is_fatal(&self) -> bool {
        match self {
            RenderError::Rhi(err) => !err.is_transient(),
            _ => true,
        }
    }
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert!(RenderError::PoolExhausted { capacity: 2 }.is_fatal());
        assert!(RenderError::InvalidSlot { index: 5, capacity: 2 }.is_fatal());
        assert!(RenderError::ResultPending(0).is_fatal());
        assert!(
            RenderError::FrameAbandoned {
                frame: 3,
                source: Box::new(RhiError::OutOfDate.into()),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_device_errors_follow_rhi_classification() {
        assert!(!RenderError::from(RhiError::OutOfDate).is_fatal());
        assert!(RenderError::from(RhiError::Timeout(Duration::from_millis(100))).is_fatal());
        assert!(RenderError::from(RhiError::DeviceLost).is_fatal());
    }

    #[test]
    fn test_unexpected_state_message() {
        let err = RenderError::UnexpectedState {
            index: 1,
            actual: SlotState::Free,
            operation: "acquire",
        };
        assert_eq!(err.to_string(), "Cannot acquire slot 1 while it is Free");
    }
}
