//! Deterministic camera session for headless runs and tests.

use std::sync::Arc;

use frameslot_core::SessionSettings;
use frameslot_resources::{AssetLoader, ImageData};
use frameslot_rhi::texture::Texture;
use frameslot_rhi::{Extent2D, GpuDevice, PixelFormat, TextureDesc};
use glam::{Mat4, Quat, Vec2, Vec3};
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::frame::{DisplayRotation, SyntheticFrame};
use crate::ArSession;

/// Time between two synthetic camera frames (30 Hz).
pub const FRAME_INTERVAL_NS: u64 = 33_333_333;

/// Horizontal distance in pixels the pattern square moves per frame.
const PATTERN_SPEED: usize = 4;

/// Camera session that needs no tracking hardware.
///
/// Without a backdrop the camera image is a gray ramp with a bright square
/// sliding across it, redrawn on every update. With a backdrop the decoded
/// image is uploaded once and stays static. The camera orbits the origin at
/// a fixed height.
pub struct SyntheticSession<D: GpuDevice + ?Sized> {
    camera: Texture<D>,
    animated: bool,
    display: Extent2D,
    rotation: DisplayRotation,
    geometry_changed: bool,
    frame_number: u64,
}

impl<D: GpuDevice + ?Sized> SyntheticSession<D> {
    /// Creates a session from configuration.
    ///
    /// `settings.width` and `settings.height` size the camera image unless a
    /// backdrop is configured, in which case the backdrop's size is used.
    pub fn new(
        device: Arc<D>,
        settings: &SessionSettings,
        loader: &dyn AssetLoader,
    ) -> SessionResult<Self> {
        let rotation = DisplayRotation::from_degrees(settings.rotation)?;
        let mut session = match &settings.backdrop {
            Some(path) => Self::with_backdrop(device, loader.load_image(path)?)?,
            None => Self::with_pattern(device, Extent2D::new(settings.width, settings.height))?,
        };

        let camera = session.camera.extent();
        let display = if rotation.is_portrait() {
            Extent2D::new(camera.height, camera.width)
        } else {
            camera
        };
        session.set_display_geometry(rotation, display.width, display.height)?;
        Ok(session)
    }

    /// Creates a session drawing the moving pattern at `extent`.
    pub fn with_pattern(device: Arc<D>, extent: Extent2D) -> SessionResult<Self> {
        let camera = Self::camera_texture(device, extent)?;
        info!(
            "Created synthetic session with a {}x{} pattern",
            extent.width, extent.height
        );
        Ok(Self::from_camera(camera, true))
    }

    /// Creates a session showing a static image.
    pub fn with_backdrop(device: Arc<D>, image: ImageData) -> SessionResult<Self> {
        let extent = Extent2D::new(image.width, image.height);
        let camera = Self::camera_texture(device, extent)?;
        camera.write(&image.pixels)?;
        info!(
            "Created synthetic session with a {}x{} backdrop",
            extent.width, extent.height
        );
        Ok(Self::from_camera(camera, false))
    }

    fn camera_texture(device: Arc<D>, extent: Extent2D) -> SessionResult<Texture<D>> {
        if extent.is_empty() {
            return Err(SessionError::InvalidSize {
                what: "camera",
                width: extent.width,
                height: extent.height,
            });
        }
        let desc = TextureDesc::new(extent.width, extent.height, PixelFormat::Rgba8);
        Ok(Texture::new(device, desc)?)
    }

    fn from_camera(camera: Texture<D>, animated: bool) -> Self {
        Self {
            display: camera.extent(),
            camera,
            animated,
            rotation: DisplayRotation::Deg0,
            geometry_changed: true,
            frame_number: 0,
        }
    }

    /// Reports a new display size and orientation.
    ///
    /// The next frame returns `true` from `display_geometry_changed`.
    pub fn set_display_geometry(
        &mut self,
        rotation: DisplayRotation,
        width: u32,
        height: u32,
    ) -> SessionResult<()> {
        if width == 0 || height == 0 {
            return Err(SessionError::InvalidSize {
                what: "display",
                width,
                height,
            });
        }

        self.rotation = rotation;
        self.display = Extent2D::new(width, height);
        self.geometry_changed = true;
        debug!(
            "Display geometry changed: {}x{} at {} degrees",
            width,
            height,
            rotation.degrees()
        );
        Ok(())
    }

    #[inline]
    pub fn camera_extent(&self) -> Extent2D {
        self.camera.extent()
    }

    #[inline]
    pub fn display_extent(&self) -> Extent2D {
        self.display
    }

    #[inline]
    pub fn rotation(&self) -> DisplayRotation {
        self.rotation
    }

    /// Number of frames returned so far.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Share of the camera image cut from each side so that it fills the
    /// display without distortion.
    fn display_crop(&self) -> Vec2 {
        let camera = self.camera.extent();
        let (display_w, display_h) = if self.rotation.is_portrait() {
            (self.display.height, self.display.width)
        } else {
            (self.display.width, self.display.height)
        };

        let camera_aspect = camera.width as f32 / camera.height as f32;
        let display_aspect = display_w as f32 / display_h as f32;
        if camera_aspect > display_aspect {
            Vec2::new((1.0 - display_aspect / camera_aspect) / 2.0, 0.0)
        } else {
            Vec2::new(0.0, (1.0 - camera_aspect / display_aspect) / 2.0)
        }
    }
}

impl<D: GpuDevice + ?Sized> ArSession for SyntheticSession<D> {
    type Frame = SyntheticFrame;

    fn update(&mut self) -> SessionResult<SyntheticFrame> {
        let frame_number = self.frame_number;
        if self.animated {
            self.camera
                .write(&pattern(self.camera.extent(), frame_number))?;
        }

        let timestamp = frame_number * FRAME_INTERVAL_NS;
        let angle = timestamp as f32 * 1e-9 * 0.5;
        let pose = Mat4::from_rotation_translation(
            Quat::from_rotation_y(angle),
            Vec3::new(0.0, 1.5, 0.0),
        );

        let frame = SyntheticFrame {
            pose,
            geometry_changed: std::mem::take(&mut self.geometry_changed),
            rotation: self.rotation,
            crop: self.display_crop(),
            texture: self.camera.handle(),
            extent: self.camera.extent(),
            timestamp,
        };
        self.frame_number += 1;
        Ok(frame)
    }
}

/// RGBA8 camera image for `frame`: a gray ramp from left to right with a
/// white square travelling along the middle row.
pub(crate) fn pattern(extent: Extent2D, frame: u64) -> Vec<u8> {
    let width = extent.width as usize;
    let height = extent.height as usize;
    let side = (width.min(height) / 4).max(1);
    let positions = width - side + 1;
    let left = (frame as usize).wrapping_mul(PATTERN_SPEED) % positions;
    let top = (height - side) / 2;

    let mut pixels = Vec::with_capacity(extent.byte_size(PixelFormat::Rgba8));
    for y in 0..height {
        for x in 0..width {
            let inside = (left..left + side).contains(&x) && (top..top + side).contains(&y);
            let value = if inside {
                255
            } else {
                (32 + x * 96 / width) as u8
            };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    pixels
}
