//! Synchronization primitives.
//!
//! This module provides owning wrappers for the device's synchronization
//! objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//! - [`FrameSync`] - Per-frame synchronization primitives for rendering
//!
//! # Overview
//!
//! - **Semaphores** order operations on the queue. For example, waiting for
//!   image acquisition before rendering, or waiting for rendering to complete
//!   before presentation.
//!
//! - **Fences** let the CPU find out that GPU work is complete. Every slot of
//!   a frame-resource pool owns one, and the slot is not reused before its
//!   fence has signaled.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use frameslot_rhi::headless::HeadlessDevice;
//! use frameslot_rhi::sync::{Fence, Semaphore};
//!
//! # fn example() -> Result<(), frameslot_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//!
//! // Create a semaphore for GPU-to-GPU synchronization
//! let _image_available = Semaphore::new(device.clone())?;
//!
//! // Create a fence for GPU-to-CPU synchronization (signaled initially)
//! let in_flight_fence = Fence::new(device, true)?;
//!
//! // Wait for the fence before starting a new frame
//! in_flight_fence.wait(Duration::from_millis(100))?;
//! in_flight_fence.reset()?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::device::GpuDevice;
use crate::error::RhiResult;
use crate::handle::{FenceHandle, SemaphoreHandle};

/// Semaphore wrapper.
///
/// Semaphores are used for GPU-to-GPU synchronization between queue operations.
/// Common use cases include:
/// - Image available semaphore: signaled when a swapchain image is ready
/// - Render finished semaphore: signaled when rendering is complete
pub struct Semaphore<D: GpuDevice + ?Sized> {
    /// Device that owns the semaphore.
    device: Arc<D>,
    /// Semaphore handle.
    semaphore: SemaphoreHandle,
}

impl<D: GpuDevice + ?Sized> Semaphore<D> {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;

        debug!("Created semaphore {:?}", semaphore);

        Ok(Self { device, semaphore })
    }

    /// Returns the semaphore handle.
    #[inline]
    pub fn handle(&self) -> SemaphoreHandle {
        self.semaphore
    }
}

impl<D: GpuDevice + ?Sized> Drop for Semaphore<D> {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Fence wrapper.
///
/// Fences are used for GPU-to-CPU synchronization, allowing the host to wait
/// for GPU operations to complete. Common use cases include:
/// - Frame-in-flight fence: wait before reusing command buffers
/// - Readback fence: wait before mapping a transfer buffer
pub struct Fence<D: GpuDevice + ?Sized> {
    /// Device that owns the fence.
    device: Arc<D>,
    /// Fence handle.
    fence: FenceHandle,
}

impl<D: GpuDevice + ?Sized> Fence<D> {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The device
    /// * `signaled` - If true, creates the fence in the signaled state.
    ///   This is useful for fences that are waited on before the first
    ///   GPU operation that would signal them.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<D>, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;

        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { device, fence })
    }

    /// Returns the fence handle.
    #[inline]
    pub fn handle(&self) -> FenceHandle {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if the fence
    /// is not signaled within `timeout`, or another error if the wait fails.
    pub fn wait(&self, timeout: Duration) -> RhiResult<()> {
        self.device.wait_for_fence(self.fence, timeout)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be in use by any queue operation when this is called.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fence(self.fence)
    }

    /// Checks if the fence is currently signaled without blocking.
    pub fn is_signaled(&self) -> bool {
        matches!(self.device.fence_signaled(self.fence), Ok(true))
    }
}

impl<D: GpuDevice + ?Sized> Drop for Fence<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
        debug!("Destroyed fence {:?}", self.fence);
    }
}

/// Per-frame synchronization primitives.
///
/// This struct groups all synchronization objects needed for one frame slot:
/// - Image available semaphore: signaled when swapchain image is acquired
/// - Render finished semaphore: signaled when rendering is complete
/// - In-flight fence: used to wait before reusing frame resources
///
/// # Usage Pattern
///
/// ```text
/// 1. Wait for in_flight_fence (CPU waits for GPU to finish the slot's last frame)
/// 2. Acquire swapchain image (signals image_available_semaphore)
/// 3. Record commands
/// 4. Reset in_flight_fence, then submit:
///    - Wait on image_available_semaphore
///    - Signal render_finished_semaphore
///    - Signal in_flight_fence on completion
/// 5. Present (waits on render_finished_semaphore)
/// ```
///
/// The fence is reset right before the submit rather than after the wait, so
/// a frame that is abandoned between the two leaves the fence signaled.
pub struct FrameSync<D: GpuDevice + ?Sized> {
    /// Semaphore signaled when a swapchain image is available.
    image_available_semaphore: Semaphore<D>,
    /// Semaphore signaled when rendering is complete.
    render_finished_semaphore: Semaphore<D>,
    /// Fence used to wait for frame completion before reusing resources.
    in_flight_fence: Fence<D>,
}

impl<D: GpuDevice + ?Sized> FrameSync<D> {
    /// Creates a new set of frame synchronization primitives.
    ///
    /// The in-flight fence is created in the signaled state so the first
    /// frame can proceed without waiting.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        let image_available_semaphore = Semaphore::new(device.clone())?;
        let render_finished_semaphore = Semaphore::new(device.clone())?;
        // Start signaled so the first wait doesn't block forever
        let in_flight_fence = Fence::new(device, true)?;

        info!("Created frame synchronization primitives");

        Ok(Self {
            image_available_semaphore,
            render_finished_semaphore,
            in_flight_fence,
        })
    }

    /// Returns a reference to the image available semaphore.
    #[inline]
    pub fn image_available_semaphore(&self) -> &Semaphore<D> {
        &self.image_available_semaphore
    }

    /// Returns a reference to the render finished semaphore.
    #[inline]
    pub fn render_finished_semaphore(&self) -> &Semaphore<D> {
        &self.render_finished_semaphore
    }

    /// Returns a reference to the in-flight fence.
    #[inline]
    pub fn in_flight_fence(&self) -> &Fence<D> {
        &self.in_flight_fence
    }

    #[inline]
    pub fn image_available_handle(&self) -> SemaphoreHandle {
        self.image_available_semaphore.handle()
    }

    #[inline]
    pub fn render_finished_handle(&self) -> SemaphoreHandle {
        self.render_finished_semaphore.handle()
    }

    #[inline]
    pub fn in_flight_fence_handle(&self) -> FenceHandle {
        self.in_flight_fence.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RhiError;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_signaled_fence_does_not_block() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device, true).unwrap();
        assert!(fence.is_signaled());
        fence.wait(Duration::ZERO).unwrap();
    }

    #[test]
    fn test_reset_fence_without_work_times_out() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::new(device, true).unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled());
        assert!(matches!(
            fence.wait(Duration::from_millis(1)),
            Err(RhiError::Timeout(_))
        ));
    }

    #[test]
    fn test_drop_destroys_handles() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let _sync = FrameSync::new(device.clone()).unwrap();
            assert_eq!(device.live_objects(), 3);
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_frame_sync_is_send_sync() {
        // Compile-time check that FrameSync is Send + Sync
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameSync<HeadlessDevice>>();
        assert_send_sync::<Fence<HeadlessDevice>>();
        assert_send_sync::<Semaphore<HeadlessDevice>>();
    }
}
