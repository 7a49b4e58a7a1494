//! Sobel edge detection on single-channel readback images.

use frameslot_rhi::{Extent2D, PixelFormat};

use crate::error::{RenderError, RenderResult};
use crate::image::{CpuImage, ReadbackImage};

/// Output value of pixels on an edge.
pub const EDGE: u8 = 0xFF;
/// Output value of interior pixels that are not on an edge.
pub const NO_EDGE: u8 = 0x1F;

/// Squared gradient magnitude above which a pixel is an edge.
pub const DEFAULT_THRESHOLD: i32 = 128 * 128;

/// 3x3 Sobel edge detector.
///
/// Interior pixels become [`EDGE`] or [`NO_EDGE`]; the one-pixel border of
/// the output is left at 0.
#[derive(Clone, Copy, Debug)]
pub struct EdgeDetector {
    threshold: i32,
}

impl Default for EdgeDetector {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a custom squared-magnitude threshold.
    pub fn with_threshold(threshold: i32) -> Self {
        Self { threshold }
    }

    #[inline]
    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    /// Detects edges in a harvested readback image.
    ///
    /// `output` is reallocated when its size or format does not match.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::UnsupportedImage`] unless `input` is
    /// [`PixelFormat::R8`].
    pub fn detect(&self, input: &ReadbackImage<'_>, output: &mut CpuImage) -> RenderResult<()> {
        self.detect_pixels(input.extent(), input.format(), input.pixels(), output)
    }

    /// Detects edges in an owned image.
    pub fn detect_image(&self, input: &CpuImage, output: &mut CpuImage) -> RenderResult<()> {
        self.detect_pixels(input.extent(), input.format(), input.pixels(), output)
    }

    fn detect_pixels(
        &self,
        extent: Extent2D,
        format: PixelFormat,
        input: &[u8],
        output: &mut CpuImage,
    ) -> RenderResult<()> {
        if format != PixelFormat::R8 {
            return Err(RenderError::UnsupportedImage(format!(
                "Edge detection needs a single-channel image, got {:?}",
                format
            )));
        }
        if input.len() != extent.byte_size(format) {
            return Err(RenderError::UnsupportedImage(format!(
                "{}x{} image with {} bytes",
                extent.width,
                extent.height,
                input.len()
            )));
        }

        if !output.resize(extent, PixelFormat::R8) {
            output.pixels_mut().fill(0);
        }

        let width = extent.width as usize;
        let height = extent.height as usize;
        if width < 3 || height < 3 {
            return Ok(());
        }

        let out = output.pixels_mut();
        let at = |x: usize, y: usize| i32::from(input[y * width + x]);
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let (a00, a01, a02) = (at(x - 1, y - 1), at(x, y - 1), at(x + 1, y - 1));
                let (a10, a12) = (at(x - 1, y), at(x + 1, y));
                let (a20, a21, a22) = (at(x - 1, y + 1), at(x, y + 1), at(x + 1, y + 1));

                let gx = -a00 - 2 * a10 - a20 + a02 + 2 * a12 + a22;
                let gy = a00 + 2 * a01 + a02 - a20 - 2 * a21 - a22;

                out[y * width + x] = if gx * gx + gy * gy > self.threshold {
                    EDGE
                } else {
                    NO_EDGE
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> CpuImage {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        CpuImage::from_pixels(Extent2D::new(width, height), PixelFormat::R8, pixels).unwrap()
    }

    #[test]
    fn test_flat_image_has_no_edges() {
        let input = image(5, 5, |_, _| 120);
        let mut output = CpuImage::new(Extent2D::new(1, 1), PixelFormat::R8);
        EdgeDetector::new().detect_image(&input, &mut output).unwrap();

        assert_eq!(output.extent(), Extent2D::new(5, 5));
        assert_eq!(output.pixels()[2 * 5 + 2], NO_EDGE);
        assert_eq!(output.pixels()[0], 0);
        assert_eq!(output.pixels()[4 * 5 + 4], 0);
    }

    #[test]
    fn test_vertical_step_is_an_edge() {
        // Step of 255 between columns 2 and 3
        let input = image(6, 4, |x, _| if x < 3 { 0 } else { 255 });
        let mut output = CpuImage::new(Extent2D::new(6, 4), PixelFormat::R8);
        EdgeDetector::new().detect_image(&input, &mut output).unwrap();

        let row = &output.pixels()[6..12];
        assert_eq!(row, &[0, NO_EDGE, EDGE, EDGE, NO_EDGE, 0]);
    }

    #[test]
    fn test_weak_step_stays_below_threshold() {
        // gx = 4 * 30 = 120, below 128
        let input = image(4, 3, |x, _| if x < 2 { 100 } else { 130 });
        let mut output = CpuImage::new(Extent2D::new(4, 3), PixelFormat::R8);
        EdgeDetector::new().detect_image(&input, &mut output).unwrap();
        assert_eq!(&output.pixels()[4..8], &[0, NO_EDGE, NO_EDGE, 0]);
    }

    #[test]
    fn test_bright_pixels_are_not_negative() {
        // Values above 127 must not wrap when widened
        let input = image(3, 3, |_, _| 200);
        let mut output = CpuImage::new(Extent2D::new(3, 3), PixelFormat::R8);
        EdgeDetector::new().detect_image(&input, &mut output).unwrap();
        assert_eq!(output.pixels()[4], NO_EDGE);
    }

    #[test]
    fn test_rgba_input_is_rejected() {
        let input = CpuImage::new(Extent2D::new(4, 4), PixelFormat::Rgba8);
        let mut output = CpuImage::new(Extent2D::new(4, 4), PixelFormat::R8);
        assert!(matches!(
            EdgeDetector::new().detect_image(&input, &mut output),
            Err(RenderError::UnsupportedImage(_))
        ));
    }

    #[test]
    fn test_tiny_image_is_all_border() {
        let input = image(2, 2, |_, _| 255);
        let mut output = CpuImage::new(Extent2D::new(2, 2), PixelFormat::R8);
        EdgeDetector::new().detect_image(&input, &mut output).unwrap();
        assert_eq!(output.pixels(), &[0, 0, 0, 0]);
    }
}
