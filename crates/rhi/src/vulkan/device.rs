//! Vulkan implementation of [`GpuDevice`].
//!
//! # Overview
//!
//! The device owns one graphics queue, one command pool and a gpu-allocator
//! [`Allocator`]. Resources are tracked in handle tables so the rest of the
//! workspace never sees raw Vulkan objects.
//!
//! The device does not build graphics pipelines. Every recorded command maps
//! to a transfer operation:
//! - clears use `vkCmdClearColorImage`
//! - quads use `vkCmdBlitImage`, so only axis-aligned quads are supported
//! - pixel reads use `vkCmdCopyImageToBuffer`, which does not convert formats
//!
//! Image layouts are tracked at record time. Command buffers must therefore
//! be submitted in the order they were recorded.
//!
//! # Example
//!
//! ```no_run
//! use frameslot_rhi::GpuDevice;
//! use frameslot_rhi::vulkan::{Instance, VulkanDevice, select_physical_device};
//!
//! let instance = Instance::new(false, false).expect("Failed to create instance");
//! let info = select_physical_device(instance.handle(), None).expect("No suitable GPU found");
//! let device = VulkanDevice::new(&instance, &info).expect("Failed to create logical device");
//! println!("Rendering on {}", device.name());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use tracing::{debug, error, info, warn};

use crate::device::{BindState, BufferUsage, GpuDevice, MappedRange, Submission, TextureDesc};
use crate::error::{RhiError, RhiResult};
use crate::format::{Extent2D, PixelFormat, QUAD_BYTES, QuadVertex, Rect, Viewport};
use crate::handle::{
    BufferHandle, CommandBufferHandle, FenceHandle, FramebufferHandle, SemaphoreHandle,
    TextureHandle,
};

use super::instance::Instance;
use super::physical_device::PhysicalDeviceInfo;

/// Maps a pixel format to the Vulkan format used for textures.
pub(crate) fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::R8 => vk::Format::R8_UNORM,
    }
}

fn buffer_usage_flags(usage: BufferUsage) -> (vk::BufferUsageFlags, MemoryLocation) {
    match usage {
        BufferUsage::Vertex => (
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ),
        BufferUsage::Readback => (vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu),
    }
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

fn allocation_error(err: AllocationError) -> RhiError {
    match err {
        AllocationError::OutOfMemory => RhiError::OutOfDeviceMemory,
        other => other.into(),
    }
}

struct ImageRecord {
    image: vk::Image,
    /// `None` for swapchain images, which the swapchain owns.
    allocation: Option<Allocation>,
    desc: TextureDesc,
    layout: vk::ImageLayout,
    presentable: bool,
}

struct BufferRecord {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: usize,
    usage: BufferUsage,
    mapped: bool,
}

struct CommandRecord {
    buffer: vk::CommandBuffer,
    recording: bool,
    /// Swapchain images written by the commands being recorded.
    presentable_targets: Vec<TextureHandle>,
}

#[derive(Default)]
struct Objects {
    next_id: u64,
    textures: HashMap<TextureHandle, ImageRecord>,
    framebuffers: HashMap<FramebufferHandle, TextureHandle>,
    buffers: HashMap<BufferHandle, BufferRecord>,
    fences: HashMap<FenceHandle, vk::Fence>,
    semaphores: HashMap<SemaphoreHandle, vk::Semaphore>,
    command_buffers: HashMap<CommandBufferHandle, CommandRecord>,
    bind: BindState,
}

impl Objects {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn texture_mut(&mut self, texture: TextureHandle) -> RhiResult<&mut ImageRecord> {
        self.textures
            .get_mut(&texture)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", texture)))
    }

    fn buffer(&self, buffer: BufferHandle) -> RhiResult<&BufferRecord> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> RhiResult<&mut BufferRecord> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))
    }

    fn fence(&self, fence: FenceHandle) -> RhiResult<vk::Fence> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))
    }

    fn semaphore(&self, semaphore: SemaphoreHandle) -> RhiResult<vk::Semaphore> {
        self.semaphores
            .get(&semaphore)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", semaphore)))
    }

    fn recording(&mut self, command_buffer: CommandBufferHandle) -> RhiResult<&mut CommandRecord> {
        match self.command_buffers.get_mut(&command_buffer) {
            Some(record) if record.recording => Ok(record),
            Some(_) => Err(RhiError::InvalidArgument(format!(
                "{:?} is not recording",
                command_buffer
            ))),
            None => Err(RhiError::InvalidHandle(format!("{:?}", command_buffer))),
        }
    }

    fn bound_target(&self) -> RhiResult<TextureHandle> {
        let framebuffer = self
            .bind
            .framebuffer
            .ok_or_else(|| RhiError::InvalidArgument("No framebuffer bound".to_string()))?;
        self.framebuffers
            .get(&framebuffer)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", framebuffer)))
    }
}

/// Access mask and pipeline stage that last touched an image in `layout`.
fn layout_access(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Records a layout transition and updates the tracked layout.
fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    record: &mut ImageRecord,
    new_layout: vk::ImageLayout,
) {
    if record.layout == new_layout {
        return;
    }

    let (src_access, src_stage) = layout_access(record.layout);
    let (dst_access, dst_stage) = if new_layout == vk::ImageLayout::PRESENT_SRC_KHR {
        (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
    } else {
        layout_access(new_layout)
    };

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(record.layout)
        .new_layout(new_layout)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(record.image)
        .subresource_range(COLOR_RANGE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    record.layout = new_layout;
}

/// Blits copy channels unchanged, so sampling one format into another would
/// not match the luma/replicate conversion of a shaded draw.
fn check_blit_formats(source: PixelFormat, target: PixelFormat) -> RhiResult<()> {
    if source != target {
        return Err(RhiError::Unsupported(format!(
            "Quad draw from {:?} into {:?} needs a format conversion",
            source, target
        )));
    }
    Ok(())
}

/// Converts an axis-aligned strip quad into a blit region.
///
/// Vertex order is the strip order produced by
/// [`TexCoordRect::quad`](crate::TexCoordRect::quad).
fn quad_blit(
    quad: &[QuadVertex; 4],
    viewport: Viewport,
    source: Extent2D,
    target: Extent2D,
) -> RhiResult<Option<vk::ImageBlit>> {
    let [a, b, c, d] = quad;
    let rectangular = a.position[0] == b.position[0]
        && c.position[0] == d.position[0]
        && a.position[1] == c.position[1]
        && b.position[1] == d.position[1]
        && a.uv[0] == b.uv[0]
        && c.uv[0] == d.uv[0]
        && a.uv[1] == c.uv[1]
        && b.uv[1] == d.uv[1];
    if !rectangular {
        return Err(RhiError::Unsupported(
            "Only axis-aligned quads can be drawn with blits".to_string(),
        ));
    }

    let to_x = |ndc: f32| viewport.x as f32 + (ndc + 1.0) * 0.5 * viewport.width as f32;
    let to_y = |ndc: f32| viewport.y as f32 + (ndc + 1.0) * 0.5 * viewport.height as f32;
    let dst = [
        (to_x(a.position[0]).round() as i32, to_y(a.position[1]).round() as i32),
        (to_x(d.position[0]).round() as i32, to_y(d.position[1]).round() as i32),
    ];
    if dst[0].0 == dst[1].0 || dst[0].1 == dst[1].1 {
        return Ok(None);
    }
    let in_target = |(x, y): (i32, i32)| {
        x >= 0 && y >= 0 && x as u32 <= target.width && y as u32 <= target.height
    };
    if !dst.iter().copied().all(in_target) {
        return Err(RhiError::Unsupported(format!(
            "Quad covers pixels outside the {}x{} target",
            target.width, target.height
        )));
    }

    // Sampling clamps to the edge, so clamp the source region likewise
    let to_u = |u: f32| (u.clamp(0.0, 1.0) * source.width as f32).round() as i32;
    let to_v = |v: f32| (v.clamp(0.0, 1.0) * source.height as f32).round() as i32;
    let src = [(to_u(a.uv[0]), to_v(a.uv[1])), (to_u(d.uv[0]), to_v(d.uv[1]))];

    let offset = |(x, y): (i32, i32)| vk::Offset3D { x, y, z: 0 };
    let mut src_end = offset(src[1]);
    src_end.z = 1;
    let mut dst_end = offset(dst[1]);
    dst_end.z = 1;

    Ok(Some(
        vk::ImageBlit::default()
            .src_subresource(COLOR_LAYERS)
            .src_offsets([offset(src[0]), src_end])
            .dst_subresource(COLOR_LAYERS)
            .dst_offsets([offset(dst[0]), dst_end]),
    ))
}

/// Vulkan logical device implementing [`GpuDevice`].
///
/// # Thread Safety
///
/// Handle tables, the command pool and the queue are guarded by mutexes. The
/// handle table lock is always taken before the allocator lock.
pub struct VulkanDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    name: String,
    /// `None` only while dropping.
    allocator: Mutex<Option<Allocator>>,
    queue: Mutex<vk::Queue>,
    queue_family: u32,
    /// Guarded by the `objects` lock.
    command_pool: vk::CommandPool,
    objects: Mutex<Objects>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
}

impl VulkanDevice {
    /// Creates a logical device with one graphics queue.
    ///
    /// The swapchain extension is enabled when the physical device has it.
    ///
    /// # Errors
    ///
    /// Returns an error if device, command pool or allocator creation fails.
    pub fn new(
        instance: &Instance,
        physical_device_info: &PhysicalDeviceInfo,
    ) -> Result<Arc<Self>, RhiError> {
        let queue_family = physical_device_info
            .queue_families
            .graphics_family
            .ok_or(RhiError::NoSuitableGpu)?;

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let mut extension_names = Vec::new();
        if physical_device_info.supports_swapchain {
            extension_names.push(ash::khr::swapchain::NAME.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device_info.device, &create_info, None)?
        };

        info!(
            "Logical device created with {} extension(s)",
            extension_names.len()
        );

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        debug!("Graphics queue retrieved from family {}", queue_family);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: physical_device_info.device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                return Err(e.into());
            }
        };

        info!("GPU memory allocator initialized");

        let swapchain_loader = physical_device_info
            .supports_swapchain
            .then(|| ash::khr::swapchain::Device::new(instance.handle(), &device));

        Ok(Arc::new(Self {
            device,
            physical_device: physical_device_info.device,
            name: format!("vulkan ({})", physical_device_info.device_name()),
            allocator: Mutex::new(Some(allocator)),
            queue: Mutex::new(queue),
            queue_family,
            command_pool,
            objects: Mutex::new(Objects::default()),
            swapchain_loader,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Returns the physical device handle.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the queue family all work is submitted to.
    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub(crate) fn swapchain_loader(&self) -> RhiResult<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref().ok_or_else(|| {
            RhiError::SwapchainError("Swapchain extension is not enabled".to_string())
        })
    }

    /// Runs `f` with exclusive access to the queue.
    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        f(*queue)
    }

    pub(crate) fn raw_semaphore(&self, semaphore: SemaphoreHandle) -> RhiResult<vk::Semaphore> {
        self.lock().semaphore(semaphore)
    }

    /// Registers an image owned by a swapchain as a texture.
    pub(crate) fn register_swapchain_image(
        &self,
        image: vk::Image,
        desc: TextureDesc,
    ) -> TextureHandle {
        let mut objects = self.lock();
        let handle = TextureHandle::from_raw(objects.allocate_id());
        objects.textures.insert(
            handle,
            ImageRecord {
                image,
                allocation: None,
                desc,
                layout: vk::ImageLayout::UNDEFINED,
                presentable: true,
            },
        );
        handle
    }

    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| RhiError::InvalidHandle("Allocator is gone".to_string()))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_error)
    }

    fn free(&self, allocation: Allocation) {
        let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(allocator) = allocator.as_mut()
            && let Err(e) = allocator.free(allocation)
        {
            error!("Failed to free allocation: {:?}", e);
        }
    }

    fn create_raw_buffer(
        &self,
        name: &str,
        size: usize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RhiResult<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as vk::DeviceSize)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok((buffer, allocation))
    }

    fn destroy_raw_buffer(&self, buffer: vk::Buffer, allocation: Option<Allocation>) {
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    /// Submits `cmd` and blocks until the queue is idle.
    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        self.with_queue(|queue| unsafe {
            self.device
                .queue_submit(queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(queue)
        })?;
        Ok(())
    }

    /// Uploads through a staging buffer. Blocks until the copy has executed.
    fn upload_texture(
        &self,
        objects: &mut Objects,
        texture: TextureHandle,
        data: &[u8],
    ) -> RhiResult<()> {
        let (staging, mut allocation) = self.create_raw_buffer(
            "texture staging",
            data.len(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        match allocation.mapped_slice_mut() {
            Some(slice) => slice[..data.len()].copy_from_slice(data),
            None => {
                self.destroy_raw_buffer(staging, Some(allocation));
                return Err(RhiError::Unsupported(
                    "Staging memory is not host visible".to_string(),
                ));
            }
        }

        let result = self.record_upload(objects, texture, staging);
        self.destroy_raw_buffer(staging, Some(allocation));
        result
    }

    fn record_upload(
        &self,
        objects: &mut Objects,
        texture: TextureHandle,
        staging: vk::Buffer,
    ) -> RhiResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info)? }[0];

        let result = (|| -> RhiResult<()> {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info)? };

            let record = objects.texture_mut(texture)?;
            transition(&self.device, cmd, record, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let region = vk::BufferImageCopy::default()
                .image_subresource(COLOR_LAYERS)
                .image_extent(vk::Extent3D {
                    width: record.desc.extent.width,
                    height: record.desc.extent.height,
                    depth: 1,
                });
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging,
                    record.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            transition(&self.device, cmd, record, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

            unsafe { self.device.end_command_buffer(cmd)? };
            self.submit_and_wait(cmd)
        })();

        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<TextureHandle> {
        if desc.extent.is_empty() {
            return Err(RhiError::InvalidArgument(format!(
                "Texture extent {}x{} is empty",
                desc.extent.width, desc.extent.height
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = match unsafe { self.device.create_image(&image_info, None) } {
            Ok(image) => image,
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => {
                return Err(RhiError::UnsupportedFormat(desc.format));
            }
            Err(e) => return Err(e.into()),
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation =
            match self.allocate("texture", requirements, MemoryLocation::GpuOnly, false) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(e);
                }
            };
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(e.into());
        }

        let mut objects = self.lock();
        let handle = TextureHandle::from_raw(objects.allocate_id());
        objects.textures.insert(
            handle,
            ImageRecord {
                image,
                allocation: Some(allocation),
                desc: *desc,
                layout: vk::ImageLayout::UNDEFINED,
                presentable: false,
            },
        );
        debug!(
            "Created {:?} ({}x{} {:?})",
            handle, desc.extent.width, desc.extent.height, desc.format
        );
        Ok(handle)
    }

    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> RhiResult<()> {
        let mut objects = self.lock();
        let expected = objects.texture_mut(texture)?.desc.byte_size();
        if data.len() != expected {
            return Err(RhiError::InvalidArgument(format!(
                "Texture upload of {} bytes, expected {}",
                data.len(),
                expected
            )));
        }
        self.upload_texture(&mut objects, texture, data)
    }

    fn texture_desc(&self, texture: TextureHandle) -> RhiResult<TextureDesc> {
        let mut objects = self.lock();
        Ok(objects.texture_mut(texture)?.desc)
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let record = self.lock().textures.remove(&texture);
        match record {
            Some(ImageRecord {
                image,
                allocation: Some(allocation),
                ..
            }) => {
                self.free(allocation);
                unsafe { self.device.destroy_image(image, None) };
            }
            Some(_) => {}
            None => warn!("Destroying unknown {:?}", texture),
        }
    }

    fn create_framebuffer(&self, color: TextureHandle) -> RhiResult<FramebufferHandle> {
        let mut objects = self.lock();
        objects.texture_mut(color)?;
        let handle = FramebufferHandle::from_raw(objects.allocate_id());
        objects.framebuffers.insert(handle, color);
        Ok(handle)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        let mut objects = self.lock();
        if objects.framebuffers.remove(&framebuffer).is_none() {
            warn!("Destroying unknown {:?}", framebuffer);
        }
        if objects.bind.framebuffer == Some(framebuffer) {
            objects.bind.framebuffer = None;
        }
    }

    fn create_buffer(&self, size: usize, usage: BufferUsage) -> RhiResult<BufferHandle> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let (flags, location) = buffer_usage_flags(usage);
        let (buffer, allocation) = self.create_raw_buffer(usage.name(), size, flags, location)?;

        let mut objects = self.lock();
        let handle = BufferHandle::from_raw(objects.allocate_id());
        objects.buffers.insert(
            handle,
            BufferRecord {
                buffer,
                allocation: Some(allocation),
                size,
                usage,
                mapped: false,
            },
        );
        debug!("Created {:?} ({} bytes, {})", handle, size, usage.name());
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> RhiResult<()> {
        let mut objects = self.lock();
        let record = objects.buffer_mut(buffer)?;
        if record.mapped {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is mapped",
                buffer
            )));
        }
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= record.size)
            .ok_or_else(|| {
                RhiError::InvalidArgument(format!(
                    "Write of {} bytes at offset {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    record.size
                ))
            })?;

        let slice = record
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| {
                RhiError::Unsupported(format!("{:?} is not host visible", buffer))
            })?;
        slice[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let record = self.lock().buffers.remove(&buffer);
        match record {
            Some(record) => self.destroy_raw_buffer(record.buffer, record.allocation),
            None => warn!("Destroying unknown {:?}", buffer),
        }
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&fence_info, None)? };

        let mut objects = self.lock();
        let handle = FenceHandle::from_raw(objects.allocate_id());
        objects.fences.insert(handle, fence);
        Ok(handle)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        match self.lock().fences.remove(&fence) {
            Some(raw) => unsafe { self.device.destroy_fence(raw, None) },
            None => warn!("Destroying unknown {:?}", fence),
        }
    }

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_info, None)? };

        let mut objects = self.lock();
        let handle = SemaphoreHandle::from_raw(objects.allocate_id());
        objects.semaphores.insert(handle, semaphore);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        match self.lock().semaphores.remove(&semaphore) {
            Some(raw) => unsafe { self.device.destroy_semaphore(raw, None) },
            None => warn!("Destroying unknown {:?}", semaphore),
        }
    }

    fn allocate_command_buffer(&self) -> RhiResult<CommandBufferHandle> {
        let mut objects = self.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)? }[0];

        let handle = CommandBufferHandle::from_raw(objects.allocate_id());
        objects.command_buffers.insert(
            handle,
            CommandRecord {
                buffer,
                recording: false,
                presentable_targets: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let mut objects = self.lock();
        match objects.command_buffers.remove(&command_buffer) {
            Some(record) => unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &[record.buffer]);
            },
            None => warn!("Freeing unknown {:?}", command_buffer),
        }
    }

    fn bind_state(&self) -> BindState {
        self.lock().bind
    }

    fn set_bind_state(&self, state: &BindState) {
        self.lock().bind = *state;
    }

    fn bind_framebuffer(&self, framebuffer: Option<FramebufferHandle>) {
        self.lock().bind.framebuffer = framebuffer;
    }

    fn set_viewport(&self, viewport: Viewport) {
        self.lock().bind.viewport = viewport;
    }

    fn bind_texture(&self, texture: Option<TextureHandle>) {
        self.lock().bind.texture = texture;
    }

    fn begin_commands(&self, command_buffer: CommandBufferHandle) -> RhiResult<()> {
        let mut objects = self.lock();
        let record = objects
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", command_buffer)))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_buffer(record.buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(record.buffer, &begin_info)?;
        }
        record.recording = true;
        record.presentable_targets.clear();
        Ok(())
    }

    fn end_commands(&self, command_buffer: CommandBufferHandle) -> RhiResult<()> {
        let mut objects = self.lock();
        let record = objects.recording(command_buffer)?;
        let cmd = record.buffer;
        let targets = std::mem::take(&mut record.presentable_targets);

        // Swapchain images leave every command buffer ready to present
        for target in targets {
            if let Ok(image) = objects.texture_mut(target) {
                transition(&self.device, cmd, image, vk::ImageLayout::PRESENT_SRC_KHR);
            }
        }

        unsafe { self.device.end_command_buffer(cmd)? };
        objects.recording(command_buffer)?.recording = false;
        Ok(())
    }

    fn cmd_clear(&self, command_buffer: CommandBufferHandle, color: [f32; 4]) -> RhiResult<()> {
        let mut objects = self.lock();
        let target = objects.bound_target()?;
        let cmd = objects.recording(command_buffer)?.buffer;

        let record = objects.texture_mut(target)?;
        let presentable = record.presentable;
        transition(&self.device, cmd, record, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        unsafe {
            self.device.cmd_clear_color_image(
                cmd,
                record.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                &[COLOR_RANGE],
            );
        }

        if presentable {
            objects.recording(command_buffer)?.presentable_targets.push(target);
        }
        Ok(())
    }

    /// Reads the vertex buffer while recording; later writes to it do not
    /// affect already recorded draws.
    fn cmd_draw_quad(
        &self,
        command_buffer: CommandBufferHandle,
        vertex_buffer: BufferHandle,
    ) -> RhiResult<()> {
        let mut objects = self.lock();
        let target = objects.bound_target()?;
        let viewport = objects.bind.viewport;
        let source = objects
            .bind
            .texture
            .ok_or_else(|| RhiError::InvalidArgument("No texture bound".to_string()))?;
        if source == target {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is both sampled and rendered to",
                source
            )));
        }

        let vertices = objects.buffer(vertex_buffer)?;
        let bytes = vertices
            .allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_slice())
            .filter(|bytes| bytes.len() >= QUAD_BYTES && vertices.size >= QUAD_BYTES)
            .ok_or_else(|| {
                RhiError::InvalidArgument(format!(
                    "{:?} does not hold a host-visible quad",
                    vertex_buffer
                ))
            })?;
        let quad: [QuadVertex; 4] = bytemuck::pod_read_unaligned(&bytes[..QUAD_BYTES]);

        let source_desc = objects.texture_mut(source)?.desc;
        let target_desc = objects.texture_mut(target)?.desc;
        check_blit_formats(source_desc.format, target_desc.format)?;
        let Some(blit) = quad_blit(&quad, viewport, source_desc.extent, target_desc.extent)? else {
            return Ok(());
        };

        let cmd = objects.recording(command_buffer)?.buffer;
        let src_image = {
            let record = objects.texture_mut(source)?;
            transition(&self.device, cmd, record, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            record.image
        };
        let (dst_image, presentable) = {
            let record = objects.texture_mut(target)?;
            transition(&self.device, cmd, record, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            (record.image, record.presentable)
        };

        unsafe {
            self.device.cmd_blit_image(
                cmd,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        if presentable {
            objects.recording(command_buffer)?.presentable_targets.push(target);
        }
        Ok(())
    }

    fn cmd_read_pixels(
        &self,
        command_buffer: CommandBufferHandle,
        rect: Rect,
        format: PixelFormat,
        buffer: BufferHandle,
    ) -> RhiResult<()> {
        let mut objects = self.lock();
        let source = objects.bound_target()?;

        let desc = objects.texture_mut(source)?.desc;
        if !rect.fits_in(desc.extent) {
            return Err(RhiError::InvalidArgument(format!(
                "Read rectangle {:?} exceeds {}x{} target",
                rect, desc.extent.width, desc.extent.height
            )));
        }
        if desc.format != format {
            return Err(RhiError::Unsupported(format!(
                "Reading {:?} pixels from a {:?} target needs a format conversion",
                format, desc.format
            )));
        }

        let destination = objects.buffer(buffer)?;
        if destination.usage != BufferUsage::Readback {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is not a readback buffer",
                buffer
            )));
        }
        let needed = rect.extent().byte_size(format);
        if destination.size < needed {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} holds {} bytes, read needs {}",
                buffer, destination.size, needed
            )));
        }
        let raw_buffer = destination.buffer;

        let cmd = objects.recording(command_buffer)?.buffer;
        let record = objects.texture_mut(source)?;
        transition(&self.device, cmd, record, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        let region = vk::BufferImageCopy::default()
            .image_subresource(COLOR_LAYERS)
            .image_offset(vk::Offset3D {
                x: rect.x as i32,
                y: rect.y as i32,
                z: 0,
            })
            .image_extent(vk::Extent3D {
                width: rect.width,
                height: rect.height,
                depth: 1,
            });
        let host_barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(raw_buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        unsafe {
            self.device.cmd_copy_image_to_buffer(
                cmd,
                record.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                raw_buffer,
                &[region],
            );
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[host_barrier],
                &[],
            );
        }
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let objects = self.lock();

        let mut command_buffers = Vec::with_capacity(submission.command_buffers.len());
        for handle in submission.command_buffers {
            match objects.command_buffers.get(handle) {
                Some(record) if record.recording => {
                    return Err(RhiError::InvalidArgument(format!(
                        "{:?} is still recording",
                        handle
                    )));
                }
                Some(record) => command_buffers.push(record.buffer),
                None => return Err(RhiError::InvalidHandle(format!("{:?}", handle))),
            }
        }
        let wait_semaphores = submission
            .wait_semaphores
            .iter()
            .map(|&s| objects.semaphore(s))
            .collect::<RhiResult<Vec<_>>>()?;
        let signal_semaphores = submission
            .signal_semaphores
            .iter()
            .map(|&s| objects.semaphore(s))
            .collect::<RhiResult<Vec<_>>>()?;
        let fence = match submission.fence {
            Some(handle) => {
                let fence = objects.fence(handle)?;
                if unsafe { self.device.get_fence_status(fence)? } {
                    return Err(RhiError::InvalidArgument(format!(
                        "{:?} is still signaled",
                        handle
                    )));
                }
                fence
            }
            None => vk::Fence::null(),
        };
        drop(objects);

        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        self.with_queue(|queue| unsafe { self.device.queue_submit(queue, &[submit_info], fence) })?;
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<()> {
        let raw = self.lock().fence(fence)?;
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[raw], true, nanos) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::Timeout(timeout)),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let raw = self.lock().fence(fence)?;
        unsafe { self.device.reset_fences(&[raw])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceHandle) -> RhiResult<bool> {
        let raw = self.lock().fence(fence)?;
        Ok(unsafe { self.device.get_fence_status(raw)? })
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn map_buffer(&self, buffer: BufferHandle) -> RhiResult<MappedRange> {
        let mut objects = self.lock();
        let record = objects.buffer_mut(buffer)?;
        let size = record.size;
        let allocation = record
            .allocation
            .as_ref()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?} has no memory", buffer)))?;
        let ptr = allocation
            .mapped_ptr()
            .ok_or_else(|| RhiError::Unsupported(format!("{:?} is not host visible", buffer)))?;

        if !allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            let range = vk::MappedMemoryRange::default()
                .memory(unsafe { allocation.memory() })
                .offset(0)
                .size(vk::WHOLE_SIZE);
            unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        }

        record.mapped = true;
        // Safety: the allocation is persistently mapped and holds `size` bytes;
        // it is freed only by destroy_buffer.
        Ok(unsafe { MappedRange::new(ptr.cast::<u8>(), size) })
    }

    fn unmap_buffer(&self, buffer: BufferHandle) -> RhiResult<()> {
        let mut objects = self.lock();
        let record = objects.buffer_mut(buffer)?;
        if !record.mapped {
            return Err(RhiError::InvalidArgument(format!(
                "{:?} is not mapped",
                buffer
            )));
        }
        record.mapped = false;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
        }

        let objects = std::mem::take(
            self.objects
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let leaked = objects.textures.len()
            + objects.buffers.len()
            + objects.fences.len()
            + objects.semaphores.len()
            + objects.command_buffers.len();
        if leaked > 0 {
            warn!("{} GPU object(s) still alive when the device was dropped", leaked);
        }

        for (_, record) in objects.buffers {
            self.destroy_raw_buffer(record.buffer, record.allocation);
        }
        for (_, record) in objects.textures {
            if let Some(allocation) = record.allocation {
                self.free(allocation);
                unsafe { self.device.destroy_image(record.image, None) };
            }
        }
        unsafe {
            for (_, fence) in objects.fences {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in objects.semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            // Freeing the pool frees its command buffers
            self.device.destroy_command_pool(self.command_pool, None);
        }

        // The allocator must go before the device
        drop(
            self.allocator
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        unsafe { self.device.destroy_device(None) };
        info!("Logical device destroyed");
    }
}

// Safety: VulkanDevice is Send+Sync because:
// - ash::Device and the swapchain loader are Send+Sync
// - the queue, the allocator and the handle tables are behind mutexes
// - the command pool is only used while the handle table lock is held
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TexCoordRect;

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanDevice>();
    }

    #[test]
    fn full_quad_blits_whole_images() {
        let quad = TexCoordRect::FULL.quad();
        let blit = quad_blit(
            &quad,
            Viewport::new(0, 0, 64, 32),
            Extent2D::new(128, 128),
            Extent2D::new(64, 32),
        )
        .unwrap()
        .unwrap();

        assert_eq!(blit.dst_offsets[0], vk::Offset3D { x: 0, y: 0, z: 0 });
        assert_eq!(blit.dst_offsets[1], vk::Offset3D { x: 64, y: 32, z: 1 });
        assert_eq!(blit.src_offsets[1], vk::Offset3D { x: 128, y: 128, z: 1 });
    }

    #[test]
    fn cropped_quad_blits_source_window() {
        let crop = TexCoordRect {
            u0: 0.25,
            v0: 0.0,
            u1: 0.75,
            v1: 1.0,
        };
        let blit = quad_blit(
            &crop.quad(),
            Viewport::new(0, 0, 8, 8),
            Extent2D::new(16, 8),
            Extent2D::new(8, 8),
        )
        .unwrap()
        .unwrap();

        assert_eq!(blit.src_offsets[0], vk::Offset3D { x: 4, y: 0, z: 0 });
        assert_eq!(blit.src_offsets[1], vk::Offset3D { x: 12, y: 8, z: 1 });
    }

    #[test]
    fn skewed_quad_is_unsupported() {
        let mut quad = TexCoordRect::FULL.quad();
        quad[3].position = [0.5, 1.0];
        let result = quad_blit(
            &quad,
            Viewport::new(0, 0, 8, 8),
            Extent2D::new(8, 8),
            Extent2D::new(8, 8),
        );
        assert!(matches!(result, Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn quad_outside_target_is_rejected() {
        let result = quad_blit(
            &TexCoordRect::FULL.quad(),
            Viewport::new(4, 0, 8, 8),
            Extent2D::new(8, 8),
            Extent2D::new(8, 8),
        );
        assert!(matches!(result, Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn format_changing_draw_is_unsupported() {
        assert!(matches!(
            check_blit_formats(PixelFormat::Rgba8, PixelFormat::R8),
            Err(RhiError::Unsupported(_))
        ));
        assert!(matches!(
            check_blit_formats(PixelFormat::R8, PixelFormat::Rgba8),
            Err(RhiError::Unsupported(_))
        ));
        assert!(check_blit_formats(PixelFormat::R8, PixelFormat::R8).is_ok());
        assert!(check_blit_formats(PixelFormat::Rgba8, PixelFormat::Rgba8).is_ok());
    }

    #[test]
    fn empty_viewport_draws_nothing() {
        let result = quad_blit(
            &TexCoordRect::FULL.quad(),
            Viewport::new(0, 0, 0, 8),
            Extent2D::new(8, 8),
            Extent2D::new(8, 8),
        );
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn layout_access_matches_transfer_layouts() {
        let (access, stage) = layout_access(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(stage, vk::PipelineStageFlags::TRANSFER);
    }
}
