//! Single-pending readback driver.
//!
//! The per-frame flow of a computer-vision loop: harvest the result
//! submitted on the previous frame, then submit this frame's camera image.
//! At most one result is pending at a time.

use std::sync::Arc;

use tracing::trace;

use frameslot_rhi::{Extent2D, GpuDevice, TextureHandle};

use crate::error::{RenderError, RenderResult};
use crate::image::ReadbackImage;
use crate::readback::{ReaderConfig, TextureReader};

/// A [`TextureReader`] plus the one slot that was submitted but not yet
/// harvested.
pub struct ReadbackPipeline<D: GpuDevice + ?Sized> {
    reader: TextureReader<D>,
    pending: Option<usize>,
}

impl<D: GpuDevice + ?Sized> ReadbackPipeline<D> {
    pub fn new(device: Arc<D>, config: ReaderConfig) -> RenderResult<Self> {
        Ok(Self::from_reader(TextureReader::new(device, config)?))
    }

    pub fn from_reader(reader: TextureReader<D>) -> Self {
        Self {
            reader,
            pending: None,
        }
    }

    /// Submits `source` for readback.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::ResultPending`] if the previous submission has
    /// not been harvested yet.
    pub fn submit(&mut self, source: TextureHandle, source_extent: Extent2D) -> RenderResult<usize> {
        if let Some(pending) = self.pending {
            return Err(RenderError::ResultPending(pending));
        }
        let index = self.reader.submit_frame(source, source_extent)?;
        self.pending = Some(index);
        Ok(index)
    }

    /// Hands the pending result to `f` and releases its slot.
    ///
    /// Returns `Ok(None)` when nothing is pending. If the result cannot be
    /// acquired it stays pending.
    pub fn harvest<T, F>(&mut self, f: F) -> RenderResult<Option<T>>
    where
        F: FnOnce(&ReadbackImage<'_>) -> T,
    {
        let Some(index) = self.pending.take() else {
            return Ok(None);
        };

        let output = match self.reader.acquire_frame(index) {
            Ok(image) => f(&image),
            Err(e) => {
                self.pending = Some(index);
                return Err(e);
            }
        };
        self.reader.release_frame(index)?;

        trace!("Harvested readback slot {}", index);
        Ok(Some(output))
    }

    /// Harvests the previous frame's result, then submits `source`.
    pub fn process<T, F>(
        &mut self,
        source: TextureHandle,
        source_extent: Extent2D,
        f: F,
    ) -> RenderResult<Option<T>>
    where
        F: FnOnce(&ReadbackImage<'_>) -> T,
    {
        let output = self.harvest(f)?;
        self.submit(source, source_extent)?;
        Ok(output)
    }

    /// Slot of the result that has not been harvested.
    #[inline]
    pub fn pending_slot(&self) -> Option<usize> {
        self.pending
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[inline]
    pub fn reader(&self) -> &TextureReader<D> {
        &self.reader
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use frameslot_rhi::headless::HeadlessDevice;
    use frameslot_rhi::texture::Texture;
    use frameslot_rhi::{PixelFormat, RhiError, TextureDesc};

    use super::*;
    use crate::crop::CropPolicy;

    fn pipeline(device: &Arc<HeadlessDevice>) -> ReadbackPipeline<HeadlessDevice> {
        let config = ReaderConfig {
            format: PixelFormat::R8,
            width: 4,
            height: 4,
            crop: CropPolicy::Stretch,
            buffer_count: 2,
            fence_timeout: Duration::from_millis(100),
        };
        ReadbackPipeline::new(device.clone(), config).unwrap()
    }

    fn solid(device: &Arc<HeadlessDevice>, value: u8) -> Texture<HeadlessDevice> {
        Texture::new_with_data(
            device.clone(),
            TextureDesc::new(4, 4, PixelFormat::R8),
            &[value; 16],
        )
        .unwrap()
    }

    fn first_pixel(image: &ReadbackImage<'_>) -> u8 {
        image.pixels()[0]
    }

    #[test]
    fn test_second_submit_is_rejected_while_pending() {
        let device = Arc::new(HeadlessDevice::new());
        let source = solid(&device, 5);
        let mut pipeline = pipeline(&device);

        let slot = pipeline.submit(source.handle(), source.extent()).unwrap();
        assert!(matches!(
            pipeline.submit(source.handle(), source.extent()),
            Err(RenderError::ResultPending(pending)) if pending == slot
        ));
        assert_eq!(pipeline.reader().free_slots(), 1);
    }

    #[test]
    fn test_harvest_without_pending_is_none() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pipeline = pipeline(&device);
        assert_eq!(pipeline.harvest(|image| image.width()).unwrap(), None);
    }

    #[test]
    fn test_process_returns_previous_frame() {
        let device = Arc::new(HeadlessDevice::new());
        let first = solid(&device, 10);
        let second = solid(&device, 20);
        let mut pipeline = pipeline(&device);

        assert_eq!(
            pipeline.process(first.handle(), first.extent(), first_pixel).unwrap(),
            None
        );
        assert_eq!(
            pipeline.process(second.handle(), second.extent(), first_pixel).unwrap(),
            Some(10)
        );
        assert_eq!(pipeline.harvest(first_pixel).unwrap(), Some(20));
        assert_eq!(pipeline.reader().free_slots(), 2);
    }

    #[test]
    fn test_failed_harvest_keeps_result_pending() {
        let device = Arc::new(HeadlessDevice::new());
        let source = solid(&device, 5);
        let mut pipeline = pipeline(&device);
        device.flush();

        let slot = pipeline.submit(source.handle(), source.extent()).unwrap();
        device.set_hung(true);
        assert!(matches!(
            pipeline.harvest(|_| ()),
            Err(RenderError::Rhi(RhiError::Timeout(_)))
        ));
        assert_eq!(pipeline.pending_slot(), Some(slot));

        device.set_hung(false);
        assert_eq!(pipeline.harvest(|image| image.pixels()[0]).unwrap(), Some(5));
    }
}
