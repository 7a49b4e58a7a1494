//! Camera frames and display orientation.

use frameslot_rhi::{Extent2D, TextureHandle};
use glam::{Mat4, Vec2};

use crate::error::{SessionError, SessionResult};

/// Rotation of the display relative to the camera sensor, clockwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DisplayRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl DisplayRotation {
    pub fn from_degrees(degrees: u32) -> SessionResult<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(SessionError::InvalidRotation(other)),
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether the display's axes are swapped relative to the sensor.
    #[inline]
    pub fn is_portrait(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    /// Maps a normalized display coordinate to a camera texture coordinate.
    pub fn apply(self, point: [f32; 2]) -> [f32; 2] {
        let [u, v] = point;
        match self {
            Self::Deg0 => [u, v],
            Self::Deg90 => [v, 1.0 - u],
            Self::Deg180 => [1.0 - u, 1.0 - v],
            Self::Deg270 => [1.0 - v, u],
        }
    }
}

/// One camera frame as seen by the renderer.
pub trait ArFrame {
    /// World-from-camera transform.
    fn camera_pose(&self) -> Mat4;

    /// True on the first frame after the display size or rotation changed.
    fn display_geometry_changed(&self) -> bool;

    /// Maps normalized display coordinates to camera texture coordinates.
    fn transform_uv(&self, points: &[[f32; 2]; 4]) -> [[f32; 2]; 4];

    /// Texture holding the camera image of this frame.
    fn camera_texture(&self) -> TextureHandle;

    fn camera_extent(&self) -> Extent2D;

    /// Capture time in nanoseconds since the session started.
    fn timestamp(&self) -> u64;
}

/// Frame produced by [`SyntheticSession`](crate::SyntheticSession).
#[derive(Clone, Copy, Debug)]
pub struct SyntheticFrame {
    pub(crate) pose: Mat4,
    pub(crate) geometry_changed: bool,
    pub(crate) rotation: DisplayRotation,
    /// Share of the camera image hidden on each side to fill the display
    pub(crate) crop: Vec2,
    pub(crate) texture: TextureHandle,
    pub(crate) extent: Extent2D,
    pub(crate) timestamp: u64,
}

impl SyntheticFrame {
    #[inline]
    pub fn rotation(&self) -> DisplayRotation {
        self.rotation
    }
}

impl ArFrame for SyntheticFrame {
    fn camera_pose(&self) -> Mat4 {
        self.pose
    }

    fn display_geometry_changed(&self) -> bool {
        self.geometry_changed
    }

    fn transform_uv(&self, points: &[[f32; 2]; 4]) -> [[f32; 2]; 4] {
        let scale = Vec2::ONE - 2.0 * self.crop;
        points.map(|point| {
            let [u, v] = self.rotation.apply(point);
            (self.crop + Vec2::new(u, v) * scale).to_array()
        })
    }

    fn camera_texture(&self) -> TextureHandle {
        self.texture
    }

    fn camera_extent(&self) -> Extent2D {
        self.extent
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: [[f32; 2]; 4] = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];

    fn frame(rotation: DisplayRotation, crop: Vec2) -> SyntheticFrame {
        SyntheticFrame {
            pose: Mat4::IDENTITY,
            geometry_changed: false,
            rotation,
            crop,
            texture: TextureHandle::from_raw(1),
            extent: Extent2D::new(4, 4),
            timestamp: 0,
        }
    }

    #[test]
    fn test_rotation_degrees() {
        for degrees in [0, 90, 180, 270] {
            assert_eq!(DisplayRotation::from_degrees(degrees).unwrap().degrees(), degrees);
        }
        assert!(matches!(
            DisplayRotation::from_degrees(45),
            Err(SessionError::InvalidRotation(45))
        ));
    }

    #[test]
    fn test_quarter_turns_compose_to_identity() {
        let point = [0.25, 0.75];
        let mut rotated = point;
        for _ in 0..4 {
            rotated = DisplayRotation::Deg90.apply(rotated);
        }
        assert_eq!(rotated, point);
        assert_eq!(
            DisplayRotation::Deg90.apply(DisplayRotation::Deg90.apply(point)),
            DisplayRotation::Deg180.apply(point)
        );
    }

    #[test]
    fn test_transform_uv_rotates_corners() {
        let uvs = frame(DisplayRotation::Deg90, Vec2::ZERO).transform_uv(&FULL);
        assert_eq!(uvs, [[0.0, 1.0], [1.0, 1.0], [0.0, 0.0], [1.0, 0.0]]);

        let uvs = frame(DisplayRotation::Deg0, Vec2::ZERO).transform_uv(&FULL);
        assert_eq!(uvs, FULL);
    }

    #[test]
    fn test_transform_uv_applies_crop() {
        let uvs = frame(DisplayRotation::Deg0, Vec2::new(0.0, 0.25)).transform_uv(&FULL);
        assert_eq!(uvs, [[0.0, 0.25], [0.0, 0.75], [1.0, 0.25], [1.0, 0.75]]);
    }
}
