//! Command buffer management.
//!
//! [`CommandBuffer`] owns one device command buffer and exposes the recording
//! calls the frame-resource pools use. Commands capture the device bind state
//! when they are recorded.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frameslot_rhi::command::CommandBuffer;
//! use frameslot_rhi::headless::HeadlessDevice;
//! use frameslot_rhi::texture::{Framebuffer, Texture};
//! use frameslot_rhi::{GpuDevice, PixelFormat, Submission, TextureDesc};
//!
//! # fn example() -> Result<(), frameslot_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let target = Texture::new(device.clone(), TextureDesc::new(8, 8, PixelFormat::Rgba8))?;
//! let framebuffer = Framebuffer::new(device.clone(), &target)?;
//!
//! let cmd = CommandBuffer::new(device.clone())?;
//! device.bind_framebuffer(Some(framebuffer.handle()));
//! cmd.begin()?;
//! cmd.clear([1.0, 0.0, 0.0, 1.0])?;
//! cmd.end()?;
//!
//! device.submit(&Submission {
//!     command_buffers: &[cmd.handle()],
//!     ..Default::default()
//! })?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::device::GpuDevice;
use crate::error::RhiResult;
use crate::format::{PixelFormat, Rect};
use crate::handle::{BufferHandle, CommandBufferHandle};

/// Owning command buffer wrapper.
pub struct CommandBuffer<D: GpuDevice + ?Sized> {
    /// Device that owns the command buffer.
    device: Arc<D>,
    /// Command buffer handle.
    buffer: CommandBufferHandle,
}

impl<D: GpuDevice + ?Sized> CommandBuffer<D> {
    /// Allocates a new command buffer.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        let buffer = device.allocate_command_buffer()?;
        debug!("Allocated command buffer {:?}", buffer);
        Ok(Self { device, buffer })
    }

    /// Returns the command buffer handle.
    #[inline]
    pub fn handle(&self) -> CommandBufferHandle {
        self.buffer
    }

    /// Begins recording. Previously recorded commands are discarded.
    ///
    /// The command buffer must not be pending execution.
    pub fn begin(&self) -> RhiResult<()> {
        self.device.begin_commands(self.buffer)
    }

    /// Ends recording.
    pub fn end(&self) -> RhiResult<()> {
        self.device.end_commands(self.buffer)
    }

    /// Records a clear of the bound framebuffer.
    pub fn clear(&self, color: [f32; 4]) -> RhiResult<()> {
        self.device.cmd_clear(self.buffer, color)
    }

    /// Records a textured quad draw.
    pub fn draw_quad(&self, vertex_buffer: BufferHandle) -> RhiResult<()> {
        self.device.cmd_draw_quad(self.buffer, vertex_buffer)
    }

    /// Records a pixel read from the bound framebuffer into `buffer`.
    pub fn read_pixels(&self, rect: Rect, format: PixelFormat, buffer: BufferHandle) -> RhiResult<()> {
        self.device.cmd_read_pixels(self.buffer, rect, format, buffer)
    }
}

impl<D: GpuDevice + ?Sized> Drop for CommandBuffer<D> {
    fn drop(&mut self) {
        self.device.free_command_buffer(self.buffer);
        debug!("Freed command buffer {:?}", self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_clear_without_framebuffer_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let cmd = CommandBuffer::new(device).unwrap();
        cmd.begin().unwrap();
        assert!(cmd.clear([0.0; 4]).is_err());
    }

    #[test]
    fn test_recording_outside_begin_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let cmd = CommandBuffer::new(device).unwrap();
        assert!(cmd.end().is_err());
    }

    #[test]
    fn test_command_buffer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CommandBuffer<HeadlessDevice>>();
    }
}
