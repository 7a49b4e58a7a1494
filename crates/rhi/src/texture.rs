//! Textures and framebuffers.

use std::sync::Arc;

use tracing::debug;

use crate::device::{GpuDevice, TextureDesc};
use crate::error::{RhiError, RhiResult};
use crate::format::{Extent2D, PixelFormat};
use crate::handle::{FramebufferHandle, TextureHandle};

/// Owning 2D texture wrapper.
pub struct Texture<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    texture: TextureHandle,
    desc: TextureDesc,
}

impl<D: GpuDevice + ?Sized> Texture<D> {
    /// Creates a texture with undefined contents.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::UnsupportedFormat`] or
    /// [`RhiError::OutOfDeviceMemory`] if the device cannot allocate it.
    pub fn new(device: Arc<D>, desc: TextureDesc) -> RhiResult<Self> {
        if desc.extent.is_empty() {
            return Err(RhiError::InvalidArgument(format!(
                "Texture extent {}x{} is empty",
                desc.extent.width, desc.extent.height
            )));
        }

        let texture = device.create_texture(&desc)?;

        debug!(
            "Created {:?} texture {:?}: {}x{}",
            desc.format, texture, desc.extent.width, desc.extent.height
        );

        Ok(Self {
            device,
            texture,
            desc,
        })
    }

    /// Creates a texture and uploads `data` into it.
    pub fn new_with_data(device: Arc<D>, desc: TextureDesc, data: &[u8]) -> RhiResult<Self> {
        let texture = Self::new(device, desc)?;
        texture.write(data)?;
        Ok(texture)
    }

    /// Replaces the texture contents with tightly packed pixels.
    pub fn write(&self, data: &[u8]) -> RhiResult<()> {
        if data.len() != self.desc.byte_size() {
            return Err(RhiError::InvalidArgument(format!(
                "Texture upload of {} bytes, expected {}",
                data.len(),
                self.desc.byte_size()
            )));
        }
        self.device.write_texture(self.texture, data)
    }

    #[inline]
    pub fn handle(&self) -> TextureHandle {
        self.texture
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn extent(&self) -> Extent2D {
        self.desc.extent
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }
}

impl<D: GpuDevice + ?Sized> Drop for Texture<D> {
    fn drop(&mut self) {
        self.device.destroy_texture(self.texture);
        debug!("Destroyed texture {:?}", self.texture);
    }
}

/// Owning framebuffer wrapper.
///
/// The color texture is not owned; it must outlive the framebuffer.
pub struct Framebuffer<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    framebuffer: FramebufferHandle,
    extent: Extent2D,
}

impl<D: GpuDevice + ?Sized> Framebuffer<D> {
    /// Creates a framebuffer rendering into `color`.
    pub fn new(device: Arc<D>, color: &Texture<D>) -> RhiResult<Self> {
        let framebuffer = device.create_framebuffer(color.handle())?;
        debug!("Created framebuffer {:?} over {:?}", framebuffer, color.handle());
        Ok(Self {
            device,
            framebuffer,
            extent: color.extent(),
        })
    }

    #[inline]
    pub fn handle(&self) -> FramebufferHandle {
        self.framebuffer
    }

    #[inline]
    pub fn extent(&self) -> Extent2D {
        self.extent
    }
}

impl<D: GpuDevice + ?Sized> Drop for Framebuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.framebuffer);
        debug!("Destroyed framebuffer {:?}", self.framebuffer);
    }
}
