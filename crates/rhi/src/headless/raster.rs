//! Software rasterization for the headless device.

use crate::device::TextureDesc;
use crate::format::{PixelFormat, QuadVertex, Rect, Viewport};

/// Luma weights of the grayscale conversion.
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

/// Barycentric tolerance so pixels on the shared diagonal are not dropped.
const EDGE_EPSILON: f32 = -1e-5;

/// Contents of one headless texture.
pub(crate) struct TextureData {
    pub desc: TextureDesc,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn new(desc: TextureDesc) -> Self {
        Self {
            desc,
            pixels: vec![0; desc.byte_size()],
        }
    }

    fn width(&self) -> u32 {
        self.desc.extent.width
    }

    fn height(&self) -> u32 {
        self.desc.extent.height
    }

    /// Normalized RGBA color of a texel. Single-channel texels read as
    /// `(r, r, r, 1)`.
    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let bpp = self.desc.format.bytes_per_pixel();
        let offset = (y as usize * self.width() as usize + x as usize) * bpp;
        match self.desc.format {
            PixelFormat::Rgba8 => {
                let p = &self.pixels[offset..offset + 4];
                [
                    unorm(p[0]),
                    unorm(p[1]),
                    unorm(p[2]),
                    unorm(p[3]),
                ]
            }
            PixelFormat::R8 => {
                let r = unorm(self.pixels[offset]);
                [r, r, r, 1.0]
            }
        }
    }

    fn store(&mut self, x: u32, y: u32, color: [f32; 4]) {
        let format = self.desc.format;
        let offset = (y as usize * self.width() as usize + x as usize) * format.bytes_per_pixel();
        encode(color, format, &mut self.pixels[offset..offset + format.bytes_per_pixel()]);
    }
}

#[inline]
fn unorm(value: u8) -> f32 {
    value as f32 / 255.0
}

#[inline]
fn to_unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Grayscale value of a color.
#[inline]
pub(crate) fn luma(color: [f32; 4]) -> f32 {
    LUMA[0] * color[0] + LUMA[1] * color[1] + LUMA[2] * color[2]
}

fn encode(color: [f32; 4], format: PixelFormat, out: &mut [u8]) {
    match format {
        PixelFormat::Rgba8 => {
            for (dst, channel) in out.iter_mut().zip(color) {
                *dst = to_unorm8(channel);
            }
        }
        PixelFormat::R8 => out[0] = to_unorm8(luma(color)),
    }
}

/// Fills the whole target with `color`.
pub(crate) fn clear(target: &mut TextureData, color: [f32; 4]) {
    let format = target.desc.format;
    let mut pixel = [0u8; 4];
    encode(color, format, &mut pixel);
    for chunk in target.pixels.chunks_exact_mut(format.bytes_per_pixel()) {
        chunk.copy_from_slice(&pixel[..format.bytes_per_pixel()]);
    }
}

/// Bilinear sample with clamp-to-edge addressing.
fn sample(source: &TextureData, u: f32, v: f32) -> [f32; 4] {
    let fx = u * source.width() as f32 - 0.5;
    let fy = v * source.height() as f32 - 0.5;
    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = fx - x0;
    let ty = fy - y0;

    let clamp_x = |x: f32| (x as i64).clamp(0, source.width() as i64 - 1) as u32;
    let clamp_y = |y: f32| (y as i64).clamp(0, source.height() as i64 - 1) as u32;
    let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
    let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

    let c00 = source.texel(xa, ya);
    let c10 = source.texel(xb, ya);
    let c01 = source.texel(xa, yb);
    let c11 = source.texel(xb, yb);

    std::array::from_fn(|i| {
        let top = c00[i] + (c10[i] - c00[i]) * tx;
        let bottom = c01[i] + (c11[i] - c01[i]) * tx;
        top + (bottom - top) * ty
    })
}

fn barycentric(p: [f32; 2], a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> Option<[f32; 3]> {
    let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
    if det.abs() < f32::EPSILON {
        return None;
    }
    let w0 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
    let w1 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
    let w2 = 1.0 - w0 - w1;
    (w0 >= EDGE_EPSILON && w1 >= EDGE_EPSILON && w2 >= EDGE_EPSILON).then_some([w0, w1, w2])
}

/// Draws a triangle-strip quad sampling `source` into `target`.
///
/// Pixel centers are mapped through the viewport to normalized device
/// coordinates; pixel row 0 is NDC `y = -1`.
pub(crate) fn draw_quad(
    target: &mut TextureData,
    viewport: Viewport,
    source: &TextureData,
    quad: &[QuadVertex; 4],
) {
    if viewport.width == 0 || viewport.height == 0 {
        return;
    }

    let x_start = viewport.x.max(0) as u32;
    let y_start = viewport.y.max(0) as u32;
    let x_end = (viewport.x as i64 + viewport.width as i64).clamp(0, target.width() as i64) as u32;
    let y_end = (viewport.y as i64 + viewport.height as i64).clamp(0, target.height() as i64) as u32;

    let triangles = [[0usize, 1, 2], [1, 2, 3]];

    for y in y_start..y_end {
        let ndc_y = ((y as f32 + 0.5) - viewport.y as f32) / viewport.height as f32 * 2.0 - 1.0;
        for x in x_start..x_end {
            let ndc_x = ((x as f32 + 0.5) - viewport.x as f32) / viewport.width as f32 * 2.0 - 1.0;
            let p = [ndc_x, ndc_y];

            for [i0, i1, i2] in triangles {
                let (a, b, c) = (&quad[i0], &quad[i1], &quad[i2]);
                if let Some(w) = barycentric(p, a.position, b.position, c.position) {
                    let u = w[0] * a.uv[0] + w[1] * b.uv[0] + w[2] * c.uv[0];
                    let v = w[0] * a.uv[1] + w[1] * b.uv[1] + w[2] * c.uv[1];
                    target.store(x, y, sample(source, u, v));
                    break;
                }
            }
        }
    }
}

/// Copies `rect` of `source` into `out` as tightly packed rows of `format`.
pub(crate) fn read_pixels(source: &TextureData, rect: Rect, format: PixelFormat, out: &mut [u8]) {
    let bpp = format.bytes_per_pixel();
    let row_bytes = rect.width as usize * bpp;

    for row in 0..rect.height {
        let y = rect.y + row;
        let dst_row = &mut out[row as usize * row_bytes..(row as usize + 1) * row_bytes];

        if format == source.desc.format {
            let start = (y as usize * source.width() as usize + rect.x as usize) * bpp;
            dst_row.copy_from_slice(&source.pixels[start..start + row_bytes]);
        } else {
            for (col, dst) in dst_row.chunks_exact_mut(bpp).enumerate() {
                encode(source.texel(rect.x + col as u32, y), format, dst);
            }
        }
    }
}
