//! CPU views of readback results.

use frameslot_rhi::{Extent2D, PixelFormat};

use crate::error::{RenderError, RenderResult};

/// Pixels of an acquired readback slot.
///
/// The view borrows the slot's mapped transfer buffer, so the slot cannot be
/// released or resubmitted while the image is alive. Rows are tightly packed
/// and row 0 is the bottom of the source texture.
#[derive(Debug, Clone, Copy)]
pub struct ReadbackImage<'a> {
    slot: usize,
    extent: Extent2D,
    format: PixelFormat,
    pixels: &'a [u8],
}

impl<'a> ReadbackImage<'a> {
    pub(crate) fn new(slot: usize, extent: Extent2D, format: PixelFormat, pixels: &'a [u8]) -> Self {
        debug_assert_eq!(pixels.len(), extent.byte_size(format));
        Self {
            slot,
            extent,
            format,
            pixels,
        }
    }

    /// Index of the slot the pixels live in.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn pixels(&self) -> &'a [u8] {
        self.pixels
    }

    /// Bytes of row `y`, or `None` past the last row.
    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.extent.height {
            return None;
        }
        let stride = self.extent.width as usize * self.format.bytes_per_pixel();
        let start = y as usize * stride;
        self.pixels.get(start..start + stride)
    }

    /// Copies the pixels out of the transfer buffer.
    pub fn to_cpu_image(&self) -> CpuImage {
        CpuImage {
            extent: self.extent,
            format: self.format,
            pixels: self.pixels.to_vec(),
        }
    }
}

/// Owned image in host memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuImage {
    extent: Extent2D,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl CpuImage {
    /// Creates a zero-filled image.
    pub fn new(extent: Extent2D, format: PixelFormat) -> Self {
        Self {
            extent,
            format,
            pixels: vec![0; extent.byte_size(format)],
        }
    }

    /// Wraps existing pixels.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::UnsupportedImage`] if `pixels` does not hold
    /// exactly one image of `extent` and `format`.
    pub fn from_pixels(extent: Extent2D, format: PixelFormat, pixels: Vec<u8>) -> RenderResult<Self> {
        let expected = extent.byte_size(format);
        if pixels.len() != expected {
            return Err(RenderError::UnsupportedImage(format!(
                "{}x{} {:?} image needs {} bytes, got {}",
                extent.width,
                extent.height,
                format,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            extent,
            format,
            pixels,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    #[inline]
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Reallocates to `extent` and `format` if either differs, zeroing the
    /// pixels. Returns true if the image was reallocated.
    pub fn resize(&mut self, extent: Extent2D, format: PixelFormat) -> bool {
        if self.extent == extent && self.format == format {
            return false;
        }
        self.extent = extent;
        self.format = format;
        self.pixels = vec![0; extent.byte_size(format)];
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_tightly_packed() {
        let pixels: Vec<u8> = (0..12).collect();
        let image = ReadbackImage::new(0, Extent2D::new(3, 4), PixelFormat::R8, &pixels);
        assert_eq!(image.row(1), Some(&[3u8, 4, 5][..]));
        assert_eq!(image.row(4), None);
    }

    #[test]
    fn test_rgba_row_stride() {
        let pixels = vec![7u8; 2 * 2 * 4];
        let image = ReadbackImage::new(1, Extent2D::new(2, 2), PixelFormat::Rgba8, &pixels);
        assert_eq!(image.row(1).map(<[u8]>::len), Some(8));
        assert_eq!(image.slot(), 1);
    }

    #[test]
    fn test_from_pixels_checks_size() {
        let result = CpuImage::from_pixels(Extent2D::new(2, 2), PixelFormat::R8, vec![0; 3]);
        assert!(matches!(result, Err(RenderError::UnsupportedImage(_))));
    }

    #[test]
    fn test_resize_only_when_needed() {
        let mut image = CpuImage::new(Extent2D::new(4, 4), PixelFormat::R8);
        assert!(!image.resize(Extent2D::new(4, 4), PixelFormat::R8));
        assert!(image.resize(Extent2D::new(8, 2), PixelFormat::R8));
        assert_eq!(image.pixels().len(), 16);
    }
}
