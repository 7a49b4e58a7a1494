//! Graphics device and presentation traits.
//!
//! # Overview
//!
//! [`GpuDevice`] is the narrow graphics API surface the frame-resource pools
//! are written against. It follows the explicit model of modern APIs:
//! - Resources are created up front and addressed by handles
//! - Work is recorded into command buffers and submitted to a single queue
//! - Completion is observed through fences, ordering between queue
//!   operations through semaphores
//!
//! Next to that it keeps one piece of global state, the [`BindState`]
//! (current framebuffer, viewport and sampled texture). Recording commands
//! captures the bind state at the time of the call, so everything a command
//! needs must be bound before it is recorded. Use
//! [`BindGuard`](crate::BindGuard) to restore the caller's bindings.
//!
//! [`PresentTarget`] is the swapchain: a fixed ring of presentable images
//! that are acquired, rendered and presented.
//!
//! All methods take `&self` (or `&mut self` for presentation) so a device
//! can be shared through `Arc` between the pools that use it.

use std::ptr::NonNull;
use std::time::Duration;

use crate::error::RhiResult;
use crate::format::{Extent2D, PixelFormat, Rect, Viewport};
use crate::handle::{
    BufferHandle, CommandBufferHandle, FenceHandle, FramebufferHandle, SemaphoreHandle,
    TextureHandle,
};

/// Description of a 2D texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: Extent2D,
    pub format: PixelFormat,
}

impl TextureDesc {
    #[inline]
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            extent: Extent2D::new(width, height),
            format,
        }
    }

    /// Size in bytes of the texture's tightly packed contents.
    #[inline]
    pub const fn byte_size(&self) -> usize {
        self.extent.byte_size(self.format)
    }
}

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which decides where the backend
/// allocates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex buffer, written by the CPU and read by draws
    Vertex,
    /// Transfer destination for pixel reads, mapped by the CPU
    Readback,
}

impl BufferUsage {
    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Readback => "readback",
        }
    }
}

/// Snapshot of the device's global bind state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindState {
    /// Render target of clears, draws and pixel reads. `None` is the
    /// default framebuffer, which headless devices do not have.
    pub framebuffer: Option<FramebufferHandle>,
    /// Viewport of draws.
    pub viewport: Viewport,
    /// Texture sampled by draws.
    pub texture: Option<TextureHandle>,
}

/// One queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    /// Command buffers executed in order.
    pub command_buffers: &'a [CommandBufferHandle],
    /// Semaphores that must be signaled before execution starts.
    pub wait_semaphores: &'a [SemaphoreHandle],
    /// Semaphores signaled when execution finishes.
    pub signal_semaphores: &'a [SemaphoreHandle],
    /// Fence signaled when execution finishes.
    pub fence: Option<FenceHandle>,
}

/// Host view of a mapped buffer.
///
/// The range stays valid until the buffer is unmapped or destroyed. The GPU
/// must not write into the buffer while it is mapped.
#[derive(Debug)]
pub struct MappedRange {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRange {
    /// Wraps host-visible memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that stay valid and are not
    /// written until the owning buffer is unmapped.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the mapped bytes.
    ///
    /// # Safety
    ///
    /// The buffer must still be mapped, so the caller has to make sure
    /// `unmap_buffer`/`destroy_buffer` is not called while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

// Safety: MappedRange is a read-only view of host memory that is owned by the
// device, and the mapping contract above forbids concurrent writes.
unsafe impl Send for MappedRange {}
unsafe impl Sync for MappedRange {}

/// Swapchain image handed out by [`PresentTarget::acquire_next_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    /// Index of the image in the swapchain.
    pub index: u32,
    /// The image can still be presented but the swapchain should be rebuilt.
    pub suboptimal: bool,
}

/// Graphics device collaborator.
pub trait GpuDevice: Send + Sync {
    /// Short name of the backend, for logs.
    fn name(&self) -> &str;

    // Resources

    /// Creates a texture with undefined contents.
    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<TextureHandle>;
    /// Replaces the whole contents of a texture. Ordered with queue work.
    fn write_texture(&self, texture: TextureHandle, data: &[u8]) -> RhiResult<()>;
    /// Returns the description the texture was created with.
    fn texture_desc(&self, texture: TextureHandle) -> RhiResult<TextureDesc>;
    fn destroy_texture(&self, texture: TextureHandle);

    /// Creates a framebuffer rendering into `color`.
    fn create_framebuffer(&self, color: TextureHandle) -> RhiResult<FramebufferHandle>;
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    fn create_buffer(&self, size: usize, usage: BufferUsage) -> RhiResult<BufferHandle>;
    /// Writes `data` at `offset` from the host.
    fn write_buffer(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> RhiResult<()>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn allocate_command_buffer(&self) -> RhiResult<CommandBufferHandle>;
    fn free_command_buffer(&self, command_buffer: CommandBufferHandle);

    // Bind state

    fn bind_state(&self) -> BindState;
    fn set_bind_state(&self, state: &BindState);
    fn bind_framebuffer(&self, framebuffer: Option<FramebufferHandle>);
    fn set_viewport(&self, viewport: Viewport);
    fn bind_texture(&self, texture: Option<TextureHandle>);

    // Recording

    /// Starts recording, discarding previously recorded commands.
    fn begin_commands(&self, command_buffer: CommandBufferHandle) -> RhiResult<()>;
    fn end_commands(&self, command_buffer: CommandBufferHandle) -> RhiResult<()>;
    /// Clears the bound framebuffer.
    fn cmd_clear(&self, command_buffer: CommandBufferHandle, color: [f32; 4]) -> RhiResult<()>;
    /// Draws the bound texture into the bound framebuffer as a quad made of
    /// four [`QuadVertex`](crate::QuadVertex) in triangle-strip order.
    fn cmd_draw_quad(
        &self,
        command_buffer: CommandBufferHandle,
        vertex_buffer: BufferHandle,
    ) -> RhiResult<()>;
    /// Copies `rect` of the bound framebuffer into `buffer` as tightly packed
    /// rows of `format` pixels.
    fn cmd_read_pixels(
        &self,
        command_buffer: CommandBufferHandle,
        rect: Rect,
        format: PixelFormat,
        buffer: BufferHandle,
    ) -> RhiResult<()>;

    // Queue

    fn submit(&self, submission: &Submission<'_>) -> RhiResult<()>;
    /// Blocks until `fence` is signaled, or fails with
    /// [`RhiError::Timeout`](crate::RhiError::Timeout).
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<()>;
    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()>;
    fn fence_signaled(&self, fence: FenceHandle) -> RhiResult<bool>;
    /// Blocks until all submitted work has finished.
    fn wait_idle(&self) -> RhiResult<()>;

    // Host access

    fn map_buffer(&self, buffer: BufferHandle) -> RhiResult<MappedRange>;
    fn unmap_buffer(&self, buffer: BufferHandle) -> RhiResult<()>;
}

/// Presentation surface collaborator (swapchain).
pub trait PresentTarget {
    fn image_count(&self) -> usize;
    fn extent(&self) -> Extent2D;
    /// Framebuffer rendering into swapchain image `index`.
    fn framebuffer(&self, index: u32) -> RhiResult<FramebufferHandle>;
    /// Acquires the next image, signaling `signal` once it can be rendered to.
    ///
    /// An invalidated surface is reported as
    /// [`RhiError::OutOfDate`](crate::RhiError::OutOfDate).
    fn acquire_next_image(
        &mut self,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> RhiResult<AcquiredImage>;
    /// Queues image `index` for presentation after `wait` is signaled.
    ///
    /// Returns `true` if the swapchain is suboptimal.
    fn present(&mut self, index: u32, wait: SemaphoreHandle) -> RhiResult<bool>;
}
