//! Swapchain presentation.
//!
//! [`VulkanSwapchain`] implements [`PresentTarget`] over a surface created by
//! the caller. Its images are registered with the [`VulkanDevice`] as
//! textures, so frames are drawn into them through ordinary framebuffers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use frameslot_rhi::vk;
//! use frameslot_rhi::vulkan::{Instance, VulkanDevice, VulkanSwapchain};
//!
//! # fn example(instance: &Instance, device: Arc<VulkanDevice>, surface: vk::SurfaceKHR)
//! #     -> Result<(), frameslot_rhi::RhiError> {
//! let swapchain = VulkanSwapchain::new(instance, device, surface, 1280, 720)?;
//! println!("{} images", swapchain.images().len());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, warn};

use crate::device::{AcquiredImage, GpuDevice, PresentTarget, TextureDesc};
use crate::error::{RhiError, RhiResult};
use crate::format::{Extent2D, PixelFormat};
use crate::handle::{FramebufferHandle, SemaphoreHandle, TextureHandle};

use super::device::VulkanDevice;
use super::instance::Instance;

/// Swapchain surface support details.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats (format and color space combinations)
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes (FIFO, MAILBOX, IMMEDIATE, etc.)
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<Self, RhiError> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, image count: {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are
    /// available and images can be written by transfers.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty()
            && !self.present_modes.is_empty()
            && self
                .capabilities
                .supported_usage_flags
                .contains(vk::ImageUsageFlags::TRANSFER_DST)
    }
}

/// Vulkan swapchain presenting through a [`VulkanDevice`].
///
/// The swapchain is not thread-safe. Only one thread should acquire and
/// present at a time.
pub struct VulkanSwapchain {
    device: Arc<VulkanDevice>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: Extent2D,
    images: Vec<TextureHandle>,
    framebuffers: Vec<FramebufferHandle>,
}

impl VulkanSwapchain {
    /// Creates a swapchain for `surface`.
    ///
    /// The surface stays owned by the caller and must outlive the swapchain.
    ///
    /// # Errors
    ///
    /// Returns an error if the surface cannot be presented to with transfer
    /// writes or swapchain creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> Result<Self, RhiError> {
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let mut swapchain = Self {
            device,
            surface_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: Extent2D::new(0, 0),
            images: Vec::new(),
            framebuffers: Vec::new(),
        };
        swapchain.create_internal(width, height)?;
        Ok(swapchain)
    }

    /// Rebuilds the swapchain after the surface changed size.
    ///
    /// Previously returned framebuffer handles become invalid.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for the device or creation fails.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<(), RhiError> {
        self.device.wait_idle()?;
        self.release_images();
        self.create_internal(width, height)?;
        info!(
            "Swapchain recreated: {}x{}",
            self.extent.width, self.extent.height
        );
        Ok(())
    }

    /// Returns the swapchain image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the present mode.
    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Returns the textures backed by swapchain images.
    #[inline]
    pub fn images(&self) -> &[TextureHandle] {
        &self.images
    }

    fn create_internal(&mut self, width: u32, height: u32) -> Result<(), RhiError> {
        let support = SwapchainSupportDetails::query(
            self.device.physical_device(),
            self.surface,
            &self.surface_loader,
        )?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Surface does not support transfer writes to swapchain images".to_string(),
            ));
        }

        let surface_format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = determine_image_count(&support.capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.swapchain);

        let loader = self.device.swapchain_loader()?;
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.swapchain, None) };
        }
        self.swapchain = swapchain;

        let images = unsafe { loader.get_swapchain_images(swapchain)? };
        let desc = TextureDesc::new(extent.width, extent.height, PixelFormat::Rgba8);
        for image in images {
            let texture = self.device.register_swapchain_image(image, desc);
            self.framebuffers.push(self.device.create_framebuffer(texture)?);
            self.images.push(texture);
        }

        self.format = surface_format.format;
        self.present_mode = present_mode;
        self.extent = Extent2D::new(extent.width, extent.height);

        info!(
            "Swapchain created: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );
        Ok(())
    }

    fn release_images(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.device.destroy_framebuffer(framebuffer);
        }
        for texture in self.images.drain(..) {
            self.device.destroy_texture(texture);
        }
    }

    fn image_index(&self, index: u32) -> RhiResult<usize> {
        let index = index as usize;
        if index < self.images.len() {
            Ok(index)
        } else {
            Err(RhiError::InvalidArgument(format!(
                "Swapchain image {} out of {}",
                index,
                self.images.len()
            )))
        }
    }
}

impl PresentTarget for VulkanSwapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn framebuffer(&self, index: u32) -> RhiResult<FramebufferHandle> {
        Ok(self.framebuffers[self.image_index(index)?])
    }

    fn acquire_next_image(
        &mut self,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> RhiResult<AcquiredImage> {
        let semaphore = self.device.raw_semaphore(signal)?;
        let loader = self.device.swapchain_loader()?;
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        let acquired = unsafe {
            loader.acquire_next_image(self.swapchain, nanos, semaphore, vk::Fence::null())
        };
        match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    warn!("Swapchain is suboptimal");
                }
                Ok(AcquiredImage { index, suboptimal })
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(RhiError::Timeout(timeout)),
            Err(e) => Err(e.into()),
        }
    }

    fn present(&mut self, index: u32, wait: SemaphoreHandle) -> RhiResult<bool> {
        self.image_index(index)?;
        let wait_semaphores = [self.device.raw_semaphore(wait)?];
        let swapchains = [self.swapchain];
        let image_indices = [index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let loader = self.device.swapchain_loader()?;
        let presented = self
            .device
            .with_queue(|queue| unsafe { loader.queue_present(queue, &present_info) });
        Ok(presented?)
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during swapchain drop: {}", e);
        }
        self.release_images();

        if self.swapchain != vk::SwapchainKHR::null()
            && let Ok(loader) = self.device.swapchain_loader()
        {
            unsafe { loader.destroy_swapchain(self.swapchain, None) };
            info!(
                "Swapchain destroyed (was {}x{})",
                self.extent.width, self.extent.height
            );
        }
    }
}

/// Chooses the best surface format from the available formats.
///
/// Prefers B8G8R8A8_UNORM since blits copy texture bytes unchanged.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    if let Some(&format) = preferred {
        debug!("Selected preferred surface format: B8G8R8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }

    let alternative = formats.iter().find(|f| {
        f.format == vk::Format::R8G8B8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    if let Some(&format) = alternative {
        warn!("Using fallback surface format: R8G8B8A8_UNORM with SRGB_NONLINEAR");
        return format;
    }

    warn!(
        "Using first available surface format: {:?}",
        formats[0].format
    );
    formats[0]
}

/// Chooses the best present mode from the available modes.
///
/// Prefers MAILBOX, falls back to FIFO which is always available.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        debug!("Selected MAILBOX present mode (triple buffering)");
        return vk::PresentModeKHR::MAILBOX;
    }

    debug!("Selected FIFO present mode (vsync)");
    vk::PresentModeKHR::FIFO
}

/// Chooses the swapchain extent.
///
/// If the current extent is not set (width/height are u32::MAX),
/// clamps the requested size to the surface's min/max extents.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Prefers one more than the minimum, but respects the maximum if set.
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;

    // If max_image_count is 0, there's no maximum
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_surface_format_preferred() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_choose_surface_format_first_available() {
        let formats = vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];

        let chosen = choose_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);

        let modes = vec![vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_choose_extent_clamps_when_undefined() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 1000,
                height: 1000,
            },
            ..Default::default()
        };

        let extent = choose_extent(&capabilities, 2000, 50);
        assert_eq!(extent.width, 1000);
        assert_eq!(extent.height, 100);
    }

    #[test]
    fn test_determine_image_count() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);

        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&capabilities), 3);

        let unlimited = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(determine_image_count(&unlimited), 3);
    }
}
