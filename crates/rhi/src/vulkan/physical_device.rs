//! Physical device (GPU) selection.
//!
//! # Overview
//!
//! The physical device selection process involves:
//! 1. Enumerating all available GPUs
//! 2. Finding a graphics queue family, which also carries transfer work
//! 3. Checking presentation support on that family when a surface is given
//! 4. Checking that blits and readback copies work for every [`PixelFormat`]
//! 5. Selecting the most suitable GPU (preferring discrete GPUs)
//!
//! # Example
//!
//! ```no_run
//! use frameslot_rhi::vulkan::{Instance, select_physical_device};
//!
//! let instance = Instance::new(false, false).expect("Failed to create instance");
//! let device_info = select_physical_device(instance.handle(), None)
//!     .expect("Failed to select physical device");
//!
//! println!("Selected GPU: {:?}", device_info.device_name());
//! ```

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::RhiError;
use crate::format::PixelFormat;

use super::device::vk_format;

/// A surface the selected GPU must be able to present to.
#[derive(Clone, Copy)]
pub struct SurfaceRequirement<'a> {
    /// The window surface.
    pub surface: vk::SurfaceKHR,
    /// The surface extension loader.
    pub loader: &'a ash::khr::surface::Instance,
}

/// Queue family indices used by the device.
///
/// All work is submitted to one queue, so presentation is only accepted on
/// the graphics family.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueFamilyIndices {
    /// Index of the queue family that supports graphics and transfer operations.
    pub graphics_family: Option<u32>,
    /// Whether the graphics family can present to the requested surface.
    pub can_present: bool,
}

impl QueueFamilyIndices {
    /// Checks if the required queue families are available.
    #[inline]
    pub fn is_complete(&self, needs_present: bool) -> bool {
        self.graphics_family.is_some() && (!needs_present || self.can_present)
    }
}

/// Information about a physical device (GPU).
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices.
    pub queue_families: QueueFamilyIndices,
    /// Whether the swapchain extension is available.
    pub supports_swapchain: bool,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the Vulkan API version supported by the device.
    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Selects the most suitable physical device.
///
/// Pass a [`SurfaceRequirement`] when the device will drive a
/// [`VulkanSwapchain`](super::VulkanSwapchain); offscreen readback needs none.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no suitable GPU is found.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<SurfaceRequirement<'_>>,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let mut suitable_devices: Vec<(PhysicalDeviceInfo, u32)> = Vec::new();

    for device in devices {
        if let Some(info) = check_device_suitability(instance, device, surface) {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) - Score: {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            suitable_devices.push((info, score));
        }
    }

    if suitable_devices.is_empty() {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    }

    suitable_devices.sort_by(|a, b| b.1.cmp(&a.1));
    let (selected_device, score) = suitable_devices.remove(0);

    let (major, minor, patch) = selected_device.api_version();
    info!(
        "Selected GPU: '{}' ({}) - Vulkan {}.{}.{}, Score: {}",
        selected_device.device_name(),
        selected_device.device_type_name(),
        major,
        minor,
        patch,
        score
    );

    Ok(selected_device)
}

/// Returns `Some(PhysicalDeviceInfo)` if the device meets all requirements.
fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<SurfaceRequirement<'_>>,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    let device_name = unsafe {
        CStr::from_ptr(properties.device_name.as_ptr())
            .to_str()
            .unwrap_or("Unknown")
    };

    let queue_families = find_queue_families(instance, device, surface);
    if !queue_families.is_complete(surface.is_some()) {
        debug!(
            "GPU '{}' skipped: missing required queue families (graphics={}, present={})",
            device_name,
            queue_families.graphics_family.is_some(),
            queue_families.can_present
        );
        return None;
    }

    let supports_swapchain = has_extension(instance, device, ash::khr::swapchain::NAME);
    if surface.is_some() && !supports_swapchain {
        debug!("GPU '{}' skipped: swapchain extension missing", device_name);
        return None;
    }

    for format in [PixelFormat::Rgba8, PixelFormat::R8] {
        if !supports_transfer_format(instance, device, format) {
            debug!(
                "GPU '{}' skipped: {:?} cannot be blitted and copied",
                device_name, format
            );
            return None;
        }
    }

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_families,
        supports_swapchain,
    })
}

/// Finds the graphics queue family and its presentation support.
fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<SurfaceRequirement<'_>>,
) -> QueueFamilyIndices {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let mut indices = QueueFamilyIndices::default();

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        if family.queue_count == 0 || !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }

        let can_present = match surface {
            Some(req) => unsafe {
                req.loader
                    .get_physical_device_surface_support(device, i, req.surface)
                    .unwrap_or(false)
            },
            None => false,
        };

        // Prefer a graphics family that can also present
        if indices.graphics_family.is_none() || (can_present && !indices.can_present) {
            indices.graphics_family = Some(i);
            indices.can_present = can_present;
        }
    }

    indices
}

fn has_extension(instance: &ash::Instance, device: vk::PhysicalDevice, name: &CStr) -> bool {
    let extensions = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(extensions) => extensions,
        Err(_) => return false,
    };
    extensions.iter().any(|ext| {
        let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        ext_name == name
    })
}

/// Blit source and destination plus copy support for optimal-tiling images.
fn supports_transfer_format(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    format: PixelFormat,
) -> bool {
    let props =
        unsafe { instance.get_physical_device_format_properties(device, vk_format(format)) };
    props.optimal_tiling_features.contains(required_format_features())
}

/// Features every texture format must support for quad blits and readback.
pub(crate) fn required_format_features() -> vk::FormatFeatureFlags {
    vk::FormatFeatureFlags::BLIT_SRC
        | vk::FormatFeatureFlags::BLIT_DST
        | vk::FormatFeatureFlags::TRANSFER_SRC
        | vk::FormatFeatureFlags::TRANSFER_DST
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
}

/// Rates a physical device based on its capabilities.
///
/// Higher scores indicate more desirable devices.
fn rate_device(info: &PhysicalDeviceInfo) -> u32 {
    let mut score = 0u32;

    match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 10000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 1000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 100,
        vk::PhysicalDeviceType::CPU => score += 10,
        _ => score += 1,
    }

    score += info.properties.limits.max_image_dimension2_d;

    let vram_mb = (info.device_local_memory() / (1024 * 1024)) as u32;
    score += vram_mb.min(16000);

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_families_without_surface_only_need_graphics() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            can_present: false,
        };
        assert!(indices.is_complete(false));
        assert!(!indices.is_complete(true));
    }

    #[test]
    fn empty_queue_families_are_incomplete() {
        let indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete(false));
    }

    #[test]
    fn required_features_cover_blit_and_copy() {
        let features = required_format_features();
        assert!(features.contains(vk::FormatFeatureFlags::BLIT_DST));
        assert!(features.contains(vk::FormatFeatureFlags::TRANSFER_SRC));
    }
}
