//! Full-screen camera background.

use std::sync::Arc;

use tracing::debug;

use frameslot_rhi::buffer::Buffer;
use frameslot_rhi::format::{QUAD_BYTES, QUAD_POSITIONS};
use frameslot_rhi::{BufferUsage, GpuDevice, QuadVertex, TexCoordRect, TextureHandle};

use crate::cycler::FrameContext;
use crate::error::{RenderError, RenderResult};
use crate::geometry::GeometryCache;

/// Draws a texture over the whole frame with per-slot vertex buffers.
///
/// The texture coordinates change only when the display geometry does
/// (rotation, resize). Each frame slot keeps its own vertex buffer, which is
/// rewritten the first time the slot is drawn after a change.
pub struct BackgroundRenderer<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    vertices: Vec<Buffer<D>>,
    cache: GeometryCache,
    /// Texture coordinates per quad corner, in strip order.
    uvs: [[f32; 2]; 4],
    refreshes: u64,
}

impl<D: GpuDevice + ?Sized> BackgroundRenderer<D> {
    /// Creates vertex buffers for `slots` frame slots.
    pub fn new(device: Arc<D>, slots: usize) -> RenderResult<Self> {
        if slots == 0 {
            return Err(RenderError::InvalidConfig(
                "Background renderer needs at least one slot".to_string(),
            ));
        }

        let vertices = (0..slots)
            .map(|_| Buffer::new(device.clone(), BufferUsage::Vertex, QUAD_BYTES))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device,
            vertices,
            cache: GeometryCache::new(slots),
            uvs: TexCoordRect::FULL.corners(),
            refreshes: 0,
        })
    }

    /// Replaces the texture coordinates of the quad corners.
    ///
    /// Call when the display geometry has changed; every slot picks the new
    /// coordinates up on its next draw.
    pub fn update_geometry(&mut self, uvs: [[f32; 2]; 4]) {
        self.uvs = uvs;
        self.cache.invalidate();
        debug!("Background geometry now at version {}", self.cache.version());
    }

    /// Records a draw of `texture` into the frame's framebuffer.
    ///
    /// Leaves `texture` bound.
    pub fn draw(&mut self, frame: &FrameContext<'_, D>, texture: TextureHandle) -> RenderResult<()> {
        let slot = frame.slot;
        let capacity = self.vertices.len();
        let buffer = self
            .vertices
            .get(slot)
            .ok_or(RenderError::InvalidSlot {
                index: slot,
                capacity,
            })?;

        if self.cache.needs_refresh(slot) {
            let quad: [QuadVertex; 4] =
                std::array::from_fn(|i| QuadVertex::new(QUAD_POSITIONS[i], self.uvs[i]));
            buffer.write_data(0, bytemuck::cast_slice(&quad))?;
            self.cache.mark_refreshed(slot)?;
            self.refreshes += 1;
        }

        self.device.bind_texture(Some(texture));
        frame.commands.draw_quad(buffer.handle())?;
        Ok(())
    }

    /// Number of vertex buffer rewrites so far.
    #[inline]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    #[inline]
    pub fn geometry(&self) -> &GeometryCache {
        &self.cache
    }
}
