//! Vulkan backend.
//!
//! Enabled with the `vulkan` feature. The backend needs no shaders: clears,
//! quad draws and readbacks are recorded as transfer commands.
//!
//! # Overview
//!
//! - [`Instance`] loads Vulkan and owns the validation messenger
//! - [`select_physical_device`] picks a GPU that can blit and copy every
//!   [`PixelFormat`](crate::PixelFormat)
//! - [`VulkanDevice`] implements [`GpuDevice`](crate::GpuDevice)
//! - [`VulkanSwapchain`] implements [`PresentTarget`](crate::PresentTarget)

mod device;
mod instance;
mod physical_device;
mod swapchain;

pub use device::VulkanDevice;
pub use instance::Instance;
pub use physical_device::{
    PhysicalDeviceInfo, QueueFamilyIndices, SurfaceRequirement, select_physical_device,
};
pub use swapchain::{SwapchainSupportDetails, VulkanSwapchain};
