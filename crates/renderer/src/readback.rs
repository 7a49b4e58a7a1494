//! Asynchronous texture readback.
//!
//! [`TextureReader`] copies GPU textures into host memory through a fixed
//! pool of readback slots. Each slot owns an offscreen target, a transfer
//! buffer, a command buffer and a fence:
//!
//! ```text
//! submit_frame:   draw source -> slot target, read target -> transfer buffer
//!                 slot: Free -> Submitted
//! acquire_frame:  wait slot fence, map transfer buffer
//!                 slot: Submitted -> Acquired
//! release_frame:  unmap transfer buffer
//!                 slot: Submitted | Acquired -> Free
//! ```
//!
//! The source is resampled to the configured output size with the
//! configured [`CropPolicy`], and converted to the output format on the way.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frameslot_renderer::{ReaderConfig, TextureReader};
//! use frameslot_rhi::headless::HeadlessDevice;
//! use frameslot_rhi::texture::Texture;
//! use frameslot_rhi::{PixelFormat, TextureDesc};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(HeadlessDevice::new());
//! let config = ReaderConfig {
//!     format: PixelFormat::R8,
//!     width: 8,
//!     height: 8,
//!     ..ReaderConfig::default()
//! };
//! let mut reader = TextureReader::new(device.clone(), config)?;
//!
//! let camera = Texture::new_with_data(
//!     device,
//!     TextureDesc::new(8, 8, PixelFormat::R8),
//!     &[200; 64],
//! )?;
//!
//! let slot = reader.submit_frame(camera.handle(), camera.extent())?;
//! let image = reader.acquire_frame(slot)?;
//! assert!(image.pixels().iter().all(|&p| p == 200));
//! reader.release_frame(slot)?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use frameslot_core::{ImageFormat, ReadbackSettings};
use frameslot_rhi::buffer::Buffer;
use frameslot_rhi::command::CommandBuffer;
use frameslot_rhi::format::QUAD_BYTES;
use frameslot_rhi::sync::Fence;
use frameslot_rhi::texture::{Framebuffer, Texture};
use frameslot_rhi::{
    BindGuard, BufferUsage, Extent2D, GpuDevice, MappedRange, PixelFormat, Rect, RhiResult,
    Submission, TextureDesc, TextureHandle, Viewport,
};

use crate::crop::{self, CropPolicy};
use crate::error::{RenderError, RenderResult};
use crate::image::ReadbackImage;
use crate::pool::{SlotPool, SlotState};

/// Color the offscreen target is cleared to before the source is drawn.
const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Output parameters of a [`TextureReader`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReaderConfig {
    /// Pixel format of the harvested images.
    pub format: PixelFormat,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// How sources of a different aspect ratio are fitted.
    pub crop: CropPolicy,
    /// Number of slots, the maximum number of unreleased readbacks.
    pub buffer_count: usize,
    /// Longest time a harvest waits for the GPU.
    pub fence_timeout: Duration,
}

impl ReaderConfig {
    #[inline]
    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }

    /// Checks that the configuration describes a usable pool.
    pub fn validate(&self) -> RenderResult<()> {
        if self.extent().is_empty() {
            return Err(RenderError::InvalidConfig(format!(
                "Readback size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(RenderError::InvalidConfig(
                "Readback needs at least one buffer".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<&ReadbackSettings> for ReaderConfig {
    fn from(settings: &ReadbackSettings) -> Self {
        Self {
            format: match settings.format {
                ImageFormat::Rgba => PixelFormat::Rgba8,
                ImageFormat::I8 => PixelFormat::R8,
            },
            width: settings.width,
            height: settings.height,
            crop: CropPolicy::from_keep_aspect_ratio(settings.keep_aspect_ratio),
            buffer_count: settings.buffer_count,
            fence_timeout: Duration::from_millis(settings.fence_timeout_ms),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::from(&ReadbackSettings::default())
    }
}

/// GPU resources of one readback slot.
///
/// Field order is drop order: the framebuffer goes before the texture it
/// renders into.
struct ReadbackSlot<D: GpuDevice + ?Sized> {
    framebuffer: Framebuffer<D>,
    target: Texture<D>,
    /// Transfer buffer the target's pixels are read into.
    pixels: Buffer<D>,
    /// Full-screen quad carrying this slot's crop.
    vertices: Buffer<D>,
    commands: CommandBuffer<D>,
    /// Signaled when the slot's readback has landed in `pixels`.
    fence: Fence<D>,
    mapped: Option<MappedRange>,
}

impl<D: GpuDevice + ?Sized> ReadbackSlot<D> {
    fn new(device: &Arc<D>, config: &ReaderConfig) -> RhiResult<Self> {
        let desc = TextureDesc::new(config.width, config.height, config.format);
        let target = Texture::new(device.clone(), desc)?;
        let framebuffer = Framebuffer::new(device.clone(), &target)?;
        let pixels = Buffer::new(device.clone(), BufferUsage::Readback, desc.byte_size())?;
        let vertices = Buffer::new(device.clone(), BufferUsage::Vertex, QUAD_BYTES)?;
        let commands = CommandBuffer::new(device.clone())?;
        // Unsignaled: nothing has been read yet
        let fence = Fence::new(device.clone(), false)?;

        Ok(Self {
            framebuffer,
            target,
            pixels,
            vertices,
            commands,
            fence,
            mapped: None,
        })
    }
}

/// Pool of readback slots with optional dual-buffer bookkeeping.
///
/// # Thread Safety
///
/// The reader is driven from one thread. Every operation takes `&mut self`,
/// so sharing it across threads needs an external mutex.
pub struct TextureReader<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    config: ReaderConfig,
    pool: SlotPool<ReadbackSlot<D>>,
    /// Slot handed out by the last [`submit_and_acquire`](Self::submit_and_acquire).
    front: Option<usize>,
    /// Slot submitted by the last [`submit_and_acquire`](Self::submit_and_acquire).
    back: Option<usize>,
}

impl<D: GpuDevice + ?Sized> TextureReader<D> {
    /// Allocates `config.buffer_count` readback slots.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidConfig`] for an empty output size or
    /// pool, and the device error if any slot resource cannot be created
    /// (for example an unsupported output format).
    pub fn new(device: Arc<D>, config: ReaderConfig) -> RenderResult<Self> {
        config.validate()?;

        let pool = SlotPool::new(config.buffer_count, |index| {
            let slot = ReadbackSlot::new(&device, &config)?;
            debug!("Created readback slot {}", index);
            Ok(slot)
        })?;

        info!(
            "Texture reader ready on {}: {} slot(s) of {}x{} {:?}, {:?}",
            device.name(),
            config.buffer_count,
            config.width,
            config.height,
            config.format,
            config.crop
        );

        Ok(Self {
            device,
            config,
            pool,
            front: None,
            back: None,
        })
    }

    /// Draws `source` into a free slot and starts reading it back.
    ///
    /// Returns the slot index to pass to [`acquire_frame`](Self::acquire_frame).
    /// The device bind state is restored before returning.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::PoolExhausted`] if every slot is submitted or
    /// acquired, and the device error if recording or submission fails.
    pub fn submit_frame(&mut self, source: TextureHandle, source_extent: Extent2D) -> RenderResult<usize> {
        let index = self
            .pool
            .find_free_slot()
            .ok_or(RenderError::PoolExhausted {
                capacity: self.pool.capacity(),
            })?;

        let extent = self.config.extent();
        let quad = crop::tex_coords(self.config.crop, source_extent, extent).quad();
        let slot = self.pool.resource(index)?;
        slot.vertices.write_data(0, bytemuck::cast_slice(&quad))?;

        slot.fence.reset()?;
        slot.commands.begin()?;
        {
            let _guard = BindGuard::new(&*self.device);
            self.device.bind_framebuffer(Some(slot.framebuffer.handle()));
            self.device.set_viewport(Viewport::from_extent(extent));
            self.device.bind_texture(Some(source));

            slot.commands.clear(CLEAR_COLOR)?;
            slot.commands.draw_quad(slot.vertices.handle())?;
            slot.commands.read_pixels(
                Rect::from_extent(extent),
                self.config.format,
                slot.pixels.handle(),
            )?;
        }
        slot.commands.end()?;

        let command_buffers = [slot.commands.handle()];
        self.device.submit(&Submission {
            command_buffers: &command_buffers,
            fence: Some(slot.fence.handle()),
            ..Default::default()
        })?;

        self.pool.mark_submitted(index)?;
        debug!(
            "Submitted readback of {:?} ({}x{}) into slot {}",
            source, source_extent.width, source_extent.height, index
        );
        Ok(index)
    }

    /// Maps the pixels of a submitted slot.
    ///
    /// Blocks until the slot's readback has finished. Acquiring an acquired
    /// slot again returns the same pixels without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidSlot`] for an index outside the pool,
    /// [`RenderError::UnexpectedState`] for a free slot, and a timeout if
    /// the GPU does not finish within the configured fence timeout.
    pub fn acquire_frame(&mut self, index: usize) -> RenderResult<ReadbackImage<'_>> {
        let state = self.pool.state(index)?;
        if state == SlotState::Free {
            return Err(RenderError::UnexpectedState {
                index,
                actual: state,
                operation: "acquire",
            });
        }

        let timeout = self.config.fence_timeout;
        let slot = self.pool.resource_mut(index)?;
        if slot.mapped.is_none() {
            slot.fence.wait(timeout)?;
            slot.mapped = Some(slot.pixels.map()?);
        }
        self.pool.mark_acquired(index)?;

        self.mapped_image(index)
    }

    /// Returns a slot to the pool.
    ///
    /// A slot that was never acquired is waited on first, so its transfer
    /// buffer is idle once it is free.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidSlot`] for an index outside the pool and
    /// [`RenderError::UnexpectedState`] for a slot that is already free.
    pub fn release_frame(&mut self, index: usize) -> RenderResult<()> {
        let state = self.pool.state(index)?;
        let timeout = self.config.fence_timeout;
        let slot = self.pool.resource_mut(index)?;

        if state == SlotState::Submitted {
            slot.fence.wait(timeout)?;
        }
        if slot.mapped.take().is_some() {
            slot.pixels.unmap()?;
        }
        self.pool.release(index)?;

        if self.front == Some(index) {
            self.front = None;
        }
        if self.back == Some(index) {
            self.back = None;
        }
        debug!("Released readback slot {}", index);
        Ok(())
    }

    /// Dual-buffer mode: releases the previous front slot, submits `source`
    /// as the new back slot, promotes the old back slot to front and acquires
    /// it.
    ///
    /// Results lag one call behind, so the first call returns `None`. If the
    /// submit fails the back slot is left in place for the next call.
    pub fn submit_and_acquire(
        &mut self,
        source: TextureHandle,
        source_extent: Extent2D,
    ) -> RenderResult<Option<ReadbackImage<'_>>> {
        if let Some(front) = self.front.take() {
            self.release_frame(front)?;
        }
        let submitted = self.submit_frame(source, source_extent)?;
        self.front = self.back.replace(submitted);

        match self.front {
            Some(front) => self.acquire_frame(front).map(Some),
            None => Ok(None),
        }
    }

    fn mapped_image(&self, index: usize) -> RenderResult<ReadbackImage<'_>> {
        let slot = self.pool.resource(index)?;
        let range = slot.mapped.as_ref().ok_or(RenderError::UnexpectedState {
            index,
            actual: SlotState::Submitted,
            operation: "read",
        })?;
        // Safety: the range stays mapped until `release_frame`, which needs
        // `&mut self` and so cannot run while the returned image is alive.
        let pixels = unsafe { range.as_slice() };
        Ok(ReadbackImage::new(
            index,
            self.config.extent(),
            self.config.format,
            pixels,
        ))
    }

    #[inline]
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Number of slots, fixed at construction.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn slot_state(&self, index: usize) -> RenderResult<SlotState> {
        self.pool.state(index)
    }

    /// Number of slots in each state, as `(free, submitted, acquired)`.
    pub fn slot_counts(&self) -> (usize, usize, usize) {
        (
            self.pool.count(SlotState::Free),
            self.pool.count(SlotState::Submitted),
            self.pool.count(SlotState::Acquired),
        )
    }

    pub fn free_slots(&self) -> usize {
        self.pool.count(SlotState::Free)
    }

    /// Offscreen target of a slot, for inspection.
    pub fn slot_target(&self, index: usize) -> RenderResult<TextureHandle> {
        Ok(self.pool.resource(index)?.target.handle())
    }

    /// Front slot of the dual-buffer mode.
    #[inline]
    pub fn front_slot(&self) -> Option<usize> {
        self.front
    }

    /// Back slot of the dual-buffer mode.
    #[inline]
    pub fn back_slot(&self) -> Option<usize> {
        self.back
    }
}

impl<D: GpuDevice + ?Sized> Drop for TextureReader<D> {
    fn drop(&mut self) {
        // Readbacks still in flight write into buffers about to be destroyed
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for readbacks before teardown: {}", e);
        }
        for slot in self.pool.resources_mut() {
            if slot.mapped.take().is_some()
                && let Err(e) = slot.pixels.unmap()
            {
                error!("Failed to unmap readback buffer: {}", e);
            }
        }
        info!("Texture reader destroyed");
    }
}

#[cfg(test)]
mod tests {
    use frameslot_rhi::headless::HeadlessDevice;
    use frameslot_rhi::RhiError;

    use super::*;

    fn config(format: PixelFormat, width: u32, height: u32) -> ReaderConfig {
        ReaderConfig {
            format,
            width,
            height,
            crop: CropPolicy::Stretch,
            buffer_count: 2,
            fence_timeout: Duration::from_millis(100),
        }
    }

    fn solid(device: &Arc<HeadlessDevice>, value: u8) -> Texture<HeadlessDevice> {
        Texture::new_with_data(
            device.clone(),
            TextureDesc::new(4, 4, PixelFormat::R8),
            &[value; 16],
        )
        .unwrap()
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ReadbackSettings {
            format: ImageFormat::Rgba,
            keep_aspect_ratio: true,
            fence_timeout_ms: 250,
            ..ReadbackSettings::default()
        };
        let config = ReaderConfig::from(&settings);
        assert_eq!(config.format, PixelFormat::Rgba8);
        assert_eq!(config.crop, CropPolicy::KeepAspectRatio);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
        assert_eq!(config.buffer_count, 2);
    }

    #[test]
    fn test_empty_output_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let result = TextureReader::new(device, config(PixelFormat::R8, 0, 4));
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn test_unsupported_format_fails_construction() {
        let device = Arc::new(HeadlessDevice::new());
        device.set_format_supported(PixelFormat::R8, false);
        let result = TextureReader::new(device.clone(), config(PixelFormat::R8, 4, 4));
        assert!(matches!(
            result,
            Err(RenderError::Rhi(RhiError::UnsupportedFormat(PixelFormat::R8)))
        ));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn test_submit_restores_bind_state() {
        let device = Arc::new(HeadlessDevice::new());
        let source = solid(&device, 9);
        let mut reader = TextureReader::new(device.clone(), config(PixelFormat::R8, 4, 4)).unwrap();

        device.set_viewport(Viewport::new(0, 0, 1280, 720));
        let before = device.bind_state();
        reader.submit_frame(source.handle(), source.extent()).unwrap();
        assert_eq!(device.bind_state(), before);
    }

    #[test]
    fn test_acquire_waits_on_fence_not_implicit_flush() {
        let device = Arc::new(HeadlessDevice::new());
        let mut reader = TextureReader::new(device.clone(), config(PixelFormat::R8, 4, 4)).unwrap();
        let source = solid(&device, 77);

        let slot = reader.submit_frame(source.handle(), source.extent()).unwrap();
        assert_eq!(reader.acquire_frame(slot).unwrap().pixels(), &[77; 16]);
        assert_eq!(device.stats().implicit_flushes, 0);
        assert!(device.stats().blocking_waits >= 1);
    }

    #[test]
    fn test_acquire_free_slot_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut reader = TextureReader::new(device, config(PixelFormat::R8, 4, 4)).unwrap();
        assert!(matches!(
            reader.acquire_frame(0),
            Err(RenderError::UnexpectedState {
                index: 0,
                actual: SlotState::Free,
                operation: "acquire",
            })
        ));
        assert!(matches!(
            reader.acquire_frame(2),
            Err(RenderError::InvalidSlot { index: 2, capacity: 2 })
        ));
    }

    #[test]
    fn test_double_release_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut reader = TextureReader::new(device.clone(), config(PixelFormat::R8, 4, 4)).unwrap();
        let source = solid(&device, 1);

        let slot = reader.submit_frame(source.handle(), source.extent()).unwrap();
        reader.release_frame(slot).unwrap();
        assert!(matches!(
            reader.release_frame(slot),
            Err(RenderError::UnexpectedState { operation: "release", .. })
        ));
    }

    #[test]
    fn test_failed_submit_keeps_back_slot() {
        let device = Arc::new(HeadlessDevice::new());
        let source = solid(&device, 42);
        let mut reader = TextureReader::new(device.clone(), config(PixelFormat::R8, 4, 4)).unwrap();

        assert!(reader
            .submit_and_acquire(source.handle(), source.extent())
            .unwrap()
            .is_none());
        assert_eq!(reader.back_slot(), Some(0));

        // Occupy the other slot outside of the dual-buffer bookkeeping
        let extra = reader.submit_frame(source.handle(), source.extent()).unwrap();
        assert!(matches!(
            reader.submit_and_acquire(source.handle(), source.extent()),
            Err(RenderError::PoolExhausted { .. })
        ));
        assert_eq!(reader.back_slot(), Some(0));
        assert_eq!(reader.front_slot(), None);
        assert_eq!(reader.slot_state(0).unwrap(), SlotState::Submitted);

        reader.release_frame(extra).unwrap();
        let pixels = reader
            .submit_and_acquire(source.handle(), source.extent())
            .unwrap()
            .unwrap()
            .pixels()
            .to_vec();
        assert_eq!(pixels, vec![42; 16]);
        assert_eq!(reader.front_slot(), Some(0));
        assert_eq!(reader.back_slot(), Some(1));
    }

    #[test]
    fn test_hung_device_times_out_acquire() {
        let device = Arc::new(HeadlessDevice::new());
        let source = solid(&device, 1);
        let mut reader = TextureReader::new(device.clone(), config(PixelFormat::R8, 4, 4)).unwrap();
        device.flush();

        let slot = reader.submit_frame(source.handle(), source.extent()).unwrap();
        device.set_hung(true);
        let err = reader.acquire_frame(slot).unwrap_err();
        assert!(matches!(err, RenderError::Rhi(RhiError::Timeout(_))));
        assert!(err.is_fatal());
        assert_eq!(reader.slot_state(slot).unwrap(), SlotState::Submitted);
        device.set_hung(false);
    }

    #[test]
    fn test_drop_releases_all_resources() {
        let device = Arc::new(HeadlessDevice::new());
        {
            let mut reader =
                TextureReader::new(device.clone(), config(PixelFormat::Rgba8, 4, 4)).unwrap();
            let source = solid(&device, 3);
            let slot = reader.submit_frame(source.handle(), source.extent()).unwrap();
            reader.acquire_frame(slot).unwrap();
        }
        assert_eq!(device.live_objects(), 0);
        assert_eq!(device.stats().destroyed_while_pending, 0);
    }
}
