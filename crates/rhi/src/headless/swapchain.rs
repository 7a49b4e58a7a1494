//! Headless presentation target.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::HeadlessDevice;
use crate::device::{AcquiredImage, PresentTarget, TextureDesc};
use crate::error::{RhiError, RhiResult};
use crate::format::{Extent2D, PixelFormat};
use crate::handle::{FramebufferHandle, SemaphoreHandle};
use crate::texture::{Framebuffer, Texture};

/// Swapchain of offscreen RGBA images on a [`HeadlessDevice`].
///
/// Images are handed out round-robin. A presented image becomes available
/// again once its present has executed on the device queue, so acquiring
/// more images than the swapchain has runs queued work the way a real
/// presentation engine would block.
pub struct HeadlessSwapchain {
    device: Arc<HeadlessDevice>,
    id: u64,
    extent: Extent2D,
    // Framebuffers are declared first so they drop before their images
    framebuffers: Vec<Framebuffer<HeadlessDevice>>,
    images: Vec<Texture<HeadlessDevice>>,
}

impl HeadlessSwapchain {
    /// Creates a swapchain with `image_count` images of `extent`.
    pub fn new(device: Arc<HeadlessDevice>, extent: Extent2D, image_count: usize) -> RhiResult<Self> {
        if image_count == 0 {
            return Err(RhiError::SwapchainError(
                "Swapchain needs at least one image".to_string(),
            ));
        }

        let images = (0..image_count)
            .map(|_| {
                Texture::new(
                    device.clone(),
                    TextureDesc {
                        extent,
                        format: PixelFormat::Rgba8,
                    },
                )
            })
            .collect::<RhiResult<Vec<_>>>()?;
        let framebuffers = images
            .iter()
            .map(|image| Framebuffer::new(device.clone(), image))
            .collect::<RhiResult<Vec<_>>>()?;

        let id = device.register_swapchain(image_count);

        info!(
            "Created headless swapchain: {} image(s), {}x{}",
            image_count, extent.width, extent.height
        );

        Ok(Self {
            device,
            id,
            extent,
            framebuffers,
            images,
        })
    }

    /// The color texture of image `index`.
    pub fn image(&self, index: u32) -> Option<&Texture<HeadlessDevice>> {
        self.images.get(index as usize)
    }

    /// Makes the next acquire fail with [`RhiError::OutOfDate`], as after a
    /// surface resize.
    pub fn invalidate(&self) {
        self.device.invalidate_swapchain(self.id);
    }

    /// Indices of the images presented so far, in presentation order.
    pub fn presented(&self) -> Vec<u32> {
        self.device.presented_images(self.id)
    }
}

impl PresentTarget for HeadlessSwapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn framebuffer(&self, index: u32) -> RhiResult<FramebufferHandle> {
        self.framebuffers
            .get(index as usize)
            .map(Framebuffer::handle)
            .ok_or_else(|| RhiError::InvalidArgument(format!("No swapchain image {}", index)))
    }

    fn acquire_next_image(
        &mut self,
        signal: SemaphoreHandle,
        _timeout: Duration,
    ) -> RhiResult<AcquiredImage> {
        let index = self.device.acquire_swapchain_image(self.id, signal)?;
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, index: u32, wait: SemaphoreHandle) -> RhiResult<bool> {
        self.device.queue_present(self.id, index, wait)?;
        Ok(false)
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        self.device.unregister_swapchain(self.id);
        info!("Headless swapchain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GpuDevice, Submission};
    use crate::headless::CompletionMode;
    use crate::sync::Semaphore;

    fn present_empty_frame(
        device: &Arc<HeadlessDevice>,
        swapchain: &mut HeadlessSwapchain,
        acquired: &Semaphore<HeadlessDevice>,
        finished: &Semaphore<HeadlessDevice>,
    ) -> u32 {
        let image = swapchain
            .acquire_next_image(acquired.handle(), Duration::from_millis(100))
            .unwrap();
        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_commands(cmd).unwrap();
        device.end_commands(cmd).unwrap();
        device
            .submit(&Submission {
                command_buffers: &[cmd],
                wait_semaphores: &[acquired.handle()],
                signal_semaphores: &[finished.handle()],
                fence: None,
            })
            .unwrap();
        swapchain.present(image.index, finished.handle()).unwrap();
        image.index
    }

    #[test]
    fn test_images_cycle_round_robin() {
        let device = Arc::new(HeadlessDevice::with_mode(CompletionMode::Immediate));
        let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(4, 4), 2).unwrap();
        let acquired = Semaphore::new(device.clone()).unwrap();
        let finished = Semaphore::new(device.clone()).unwrap();

        let indices: Vec<u32> = (0..4)
            .map(|_| present_empty_frame(&device, &mut swapchain, &acquired, &finished))
            .collect();
        device.flush();

        assert_eq!(indices, vec![0, 1, 0, 1]);
        assert_eq!(swapchain.presented(), vec![0, 1, 0, 1]);
        assert_eq!(device.stats().semaphore_misuse, 0);
    }

    #[test]
    fn test_invalidate_reports_out_of_date_once() {
        let device = Arc::new(HeadlessDevice::new());
        let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(4, 4), 2).unwrap();
        let semaphore = Semaphore::new(device.clone()).unwrap();

        swapchain.invalidate();
        let err = swapchain
            .acquire_next_image(semaphore.handle(), Duration::ZERO)
            .unwrap_err();
        assert!(err.is_transient());
        swapchain
            .acquire_next_image(semaphore.handle(), Duration::ZERO)
            .unwrap();
    }

    #[test]
    fn test_acquiring_every_image_without_present_fails() {
        let device = Arc::new(HeadlessDevice::new());
        let mut swapchain = HeadlessSwapchain::new(device.clone(), Extent2D::new(4, 4), 1).unwrap();
        let first = Semaphore::new(device.clone()).unwrap();
        let second = Semaphore::new(device.clone()).unwrap();

        swapchain.acquire_next_image(first.handle(), Duration::ZERO).unwrap();
        assert!(matches!(
            swapchain.acquire_next_image(second.handle(), Duration::ZERO),
            Err(RhiError::SwapchainError(_))
        ));
    }
}
