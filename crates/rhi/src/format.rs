//! Pixel formats, extents and quad geometry.

use bytemuck::{Pod, Zeroable};

/// Pixel format of textures and readback data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Four 8-bit channels, RGBA order.
    Rgba8,
    /// One 8-bit channel.
    R8,
}

impl PixelFormat {
    /// Size of one pixel in bytes.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::R8 => 1,
        }
    }

    /// Number of color channels.
    #[inline]
    pub const fn channels(self) -> usize {
        self.bytes_per_pixel()
    }
}

/// Two-dimensional size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered by the extent.
    #[inline]
    pub const fn area(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Width divided by height, or 0 for an empty extent.
    pub fn aspect_ratio(self) -> f32 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    /// Size in bytes of a tightly packed image of this extent.
    #[inline]
    pub const fn byte_size(self, format: PixelFormat) -> usize {
        self.area() * format.bytes_per_pixel()
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Pixel rectangle inside a render target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Rectangle covering a whole extent.
    #[inline]
    pub const fn from_extent(extent: Extent2D) -> Self {
        Self {
            x: 0,
            y: 0,
            width: extent.width,
            height: extent.height,
        }
    }

    #[inline]
    pub const fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }

    /// Returns true if the rectangle lies entirely inside `extent`.
    pub fn fits_in(&self, extent: Extent2D) -> bool {
        self.x as u64 + self.width as u64 <= extent.width as u64
            && self.y as u64 + self.height as u64 <= extent.height as u64
    }
}

/// Viewport mapping normalized device coordinates to target pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    #[inline]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Viewport covering a whole extent from the origin.
    #[inline]
    pub const fn from_extent(extent: Extent2D) -> Self {
        Self::new(0, 0, extent.width, extent.height)
    }
}

/// One vertex of a textured quad.
///
/// Layout matches a vertex buffer of interleaved `vec2` position and
/// `vec2` texture coordinate.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    /// Position in normalized device coordinates.
    pub position: [f32; 2],
    /// Texture coordinate.
    pub uv: [f32; 2],
}

impl QuadVertex {
    #[inline]
    pub const fn new(position: [f32; 2], uv: [f32; 2]) -> Self {
        Self { position, uv }
    }
}

/// Quad corner positions in triangle-strip order.
pub const QUAD_POSITIONS: [[f32; 2]; 4] = [[-1.0, -1.0], [-1.0, 1.0], [1.0, -1.0], [1.0, 1.0]];

/// Size in bytes of a four-vertex quad.
pub const QUAD_BYTES: usize = 4 * std::mem::size_of::<QuadVertex>();

/// Texture coordinates sampled by a full-screen quad.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TexCoordRect {
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

impl TexCoordRect {
    /// The whole texture, `[0,1] x [0,1]`.
    pub const FULL: Self = Self {
        u0: 0.0,
        v0: 0.0,
        u1: 1.0,
        v1: 1.0,
    };

    /// Texture coordinates per corner, in the same strip order as
    /// [`QUAD_POSITIONS`].
    pub fn corners(&self) -> [[f32; 2]; 4] {
        [
            [self.u0, self.v0],
            [self.u0, self.v1],
            [self.u1, self.v0],
            [self.u1, self.v1],
        ]
    }

    /// Builds the full-screen quad sampling this rectangle.
    pub fn quad(&self) -> [QuadVertex; 4] {
        let uvs = self.corners();
        std::array::from_fn(|i| QuadVertex::new(QUAD_POSITIONS[i], uvs[i]))
    }
}

impl Default for TexCoordRect {
    fn default() -> Self {
        Self::FULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::R8.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_extent_byte_size() {
        let extent = Extent2D::new(64, 32);
        assert_eq!(extent.byte_size(PixelFormat::R8), 2048);
        assert_eq!(extent.byte_size(PixelFormat::Rgba8), 8192);
    }

    #[test]
    fn test_rect_fits() {
        let extent = Extent2D::new(10, 10);
        assert!(Rect::from_extent(extent).fits_in(extent));
        assert!(
            !Rect {
                x: 5,
                y: 0,
                width: 6,
                height: 1
            }
            .fits_in(extent)
        );
    }

    #[test]
    fn test_quad_vertex_layout() {
        assert_eq!(std::mem::size_of::<QuadVertex>(), 16);
        assert_eq!(QUAD_BYTES, 64);
    }

    #[test]
    fn test_full_quad_corners_follow_strip_order() {
        let quad = TexCoordRect::FULL.quad();
        assert_eq!(quad[0], QuadVertex::new([-1.0, -1.0], [0.0, 0.0]));
        assert_eq!(quad[1], QuadVertex::new([-1.0, 1.0], [0.0, 1.0]));
        assert_eq!(quad[2], QuadVertex::new([1.0, -1.0], [1.0, 0.0]));
        assert_eq!(quad[3], QuadVertex::new([1.0, 1.0], [1.0, 1.0]));
    }
}
