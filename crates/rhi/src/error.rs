//! RHI-specific error types.

use std::time::Duration;

use thiserror::Error;

use crate::format::PixelFormat;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error that has no more specific variant
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    VulkanError(ash::vk::Result),

    /// Failed to load Vulkan library
    #[cfg(feature = "vulkan")]
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[cfg(feature = "vulkan")]
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// The device ran out of memory for a resource
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// The device cannot create or render to this pixel format
    #[error("Unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    /// The backend does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A fence wait ran out of time
    #[error("Timed out after {0:?} waiting for the GPU")]
    Timeout(Duration),

    /// The device was lost
    #[error("Device lost")]
    DeviceLost,

    /// The presentation surface changed and the swapchain must be rebuilt
    #[error("Swapchain is out of date")]
    OutOfDate,

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A call was made with arguments the device cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RhiError {
    /// Returns true for errors that are expected to go away on a later frame.
    ///
    /// Only an out-of-date swapchain is transient; the frame is skipped and
    /// the caller retries on the next tick. Everything else is fatal.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, RhiError::OutOfDate)
    }
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for RhiError {
    fn from(result: ash::vk::Result) -> Self {
        use ash::vk;

        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => RhiError::OutOfDate,
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RhiError::OutOfDeviceMemory
            }
            other => RhiError::VulkanError(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_out_of_date_is_transient() {
        assert!(RhiError::OutOfDate.is_transient());
        assert!(!RhiError::DeviceLost.is_transient());
        assert!(!RhiError::Timeout(Duration::from_millis(100)).is_transient());
        assert!(!RhiError::OutOfDeviceMemory.is_transient());
    }

    #[test]
    fn test_timeout_message_names_duration() {
        let message = RhiError::Timeout(Duration::from_millis(100)).to_string();
        assert!(message.contains("100ms"));
    }
}
