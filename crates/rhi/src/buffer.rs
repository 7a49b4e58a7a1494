//! GPU buffer management.
//!
//! This module provides [`Buffer`], an owning wrapper around a device buffer
//! used either for quad vertices or as the transfer destination of a pixel
//! readback.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frameslot_rhi::buffer::Buffer;
//! use frameslot_rhi::headless::HeadlessDevice;
//! use frameslot_rhi::{BufferUsage, TexCoordRect};
//!
//! # fn example() -> Result<(), frameslot_rhi::RhiError> {
//! let device = Arc::new(HeadlessDevice::new());
//!
//! // Create a vertex buffer holding a full-screen quad
//! let quad = TexCoordRect::FULL.quad();
//! let vertex_buffer = Buffer::new_with_data(
//!     device,
//!     BufferUsage::Vertex,
//!     bytemuck::cast_slice(&quad),
//! )?;
//! assert_eq!(vertex_buffer.size(), 64);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::device::{BufferUsage, GpuDevice, MappedRange};
use crate::error::{RhiError, RhiResult};
use crate::handle::BufferHandle;

/// Owning buffer wrapper.
///
/// The buffer is destroyed on drop. A readback buffer that is still mapped
/// is unmapped first.
pub struct Buffer<D: GpuDevice + ?Sized> {
    /// Device that owns the buffer.
    device: Arc<D>,
    /// Buffer handle.
    buffer: BufferHandle,
    /// Buffer size in bytes.
    size: usize,
    /// Buffer usage type.
    usage: BufferUsage,
    /// Whether the buffer is currently mapped.
    mapped: bool,
}

impl<D: GpuDevice + ?Sized> Buffer<D> {
    /// Creates a new buffer with the specified size.
    ///
    /// # Errors
    ///
    /// Returns an error if the size is zero or allocation fails.
    pub fn new(device: Arc<D>, usage: BufferUsage, size: usize) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidArgument(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer = device.create_buffer(size, usage)?;

        debug!("Created {} buffer: {} bytes", usage.name(), size);

        Ok(Self {
            device,
            buffer,
            size,
            usage,
            mapped: false,
        })
    }

    /// Creates a new buffer and initializes it with data.
    pub fn new_with_data(device: Arc<D>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(device, usage, data.len())?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Writes data to the buffer at the specified offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would exceed the buffer size.
    pub fn write_data(&self, offset: usize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset + data.len();
        if end > self.size {
            return Err(RhiError::InvalidArgument(format!(
                "Write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }

        self.device.write_buffer(self.buffer, offset, data)
    }

    /// Maps the buffer for host reads.
    ///
    /// Callers are expected to have waited for the fence of the work that
    /// wrote the buffer.
    pub fn map(&mut self) -> RhiResult<MappedRange> {
        let range = self.device.map_buffer(self.buffer)?;
        self.mapped = true;
        Ok(range)
    }

    /// Unmaps the buffer. Any [`MappedRange`] obtained from it is invalid
    /// afterwards.
    pub fn unmap(&mut self) -> RhiResult<()> {
        if self.mapped {
            self.device.unmap_buffer(self.buffer)?;
            self.mapped = false;
        }
        Ok(())
    }

    /// Returns the buffer handle.
    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.buffer
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the buffer usage type.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }
}

impl<D: GpuDevice + ?Sized> Drop for Buffer<D> {
    fn drop(&mut self) {
        if self.mapped
            && let Err(e) = self.device.unmap_buffer(self.buffer)
        {
            tracing::error!("Failed to unmap {} buffer: {}", self.usage.name(), e);
        }

        self.device.destroy_buffer(self.buffer);

        debug!("Destroyed {} buffer", self.usage.name());
    }
}
