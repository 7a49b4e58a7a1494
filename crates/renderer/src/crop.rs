//! Source-to-target texture coordinate policies.

use frameslot_rhi::{Extent2D, TexCoordRect};

/// How a source texture is fitted into a target of another size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CropPolicy {
    /// Sample the whole source, stretching it to the target.
    #[default]
    Stretch,
    /// Sample a centered window of the source with the target's aspect ratio.
    KeepAspectRatio,
}

impl CropPolicy {
    #[inline]
    pub fn from_keep_aspect_ratio(keep: bool) -> Self {
        if keep {
            CropPolicy::KeepAspectRatio
        } else {
            CropPolicy::Stretch
        }
    }
}

/// Result of fitting a source into a target while keeping its aspect ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Crop {
    /// Width of the scaled source, in target pixels.
    pub render_width: u32,
    /// Height of the scaled source, in target pixels.
    pub render_height: u32,
    /// Texture coordinates cut from each side horizontally.
    pub offset_u: f32,
    /// Texture coordinates cut from each side vertically.
    pub offset_v: f32,
}

impl Crop {
    /// The sampled window `(offset_u, offset_v) .. (1 - offset_u, 1 - offset_v)`.
    pub fn tex_coords(&self) -> TexCoordRect {
        TexCoordRect {
            u0: self.offset_u,
            v0: self.offset_v,
            u1: 1.0 - self.offset_u,
            v1: 1.0 - self.offset_v,
        }
    }
}

/// Scales `source` to cover `target` and centers the overflow.
///
/// Render sizes use integer division, so the offsets match a renderer
/// working in whole pixels. Empty extents produce no crop.
pub fn compute_crop(source: Extent2D, target: Extent2D) -> Crop {
    if source.is_empty() || target.is_empty() {
        return Crop {
            render_width: target.width,
            render_height: target.height,
            offset_u: 0.0,
            offset_v: 0.0,
        };
    }

    let (src_w, src_h) = (u64::from(source.width), u64::from(source.height));
    let (dst_w, dst_h) = (u64::from(target.width), u64::from(target.height));

    let (render_width, render_height) = if source.aspect_ratio() < target.aspect_ratio() {
        (dst_w, src_h * dst_w / src_w)
    } else {
        (src_w * dst_h / src_h, dst_h)
    };

    let offset = |render: u64, dst: u64| -> f32 {
        if render == 0 {
            0.0
        } else {
            (render as i64 - dst as i64) as f32 / render as f32 / 2.0
        }
    };

    Crop {
        render_width: u32::try_from(render_width).unwrap_or(u32::MAX),
        render_height: u32::try_from(render_height).unwrap_or(u32::MAX),
        offset_u: offset(render_width, dst_w),
        offset_v: offset(render_height, dst_h),
    }
}

/// Texture coordinates sampled when drawing `source` into `target`.
pub fn tex_coords(policy: CropPolicy, source: Extent2D, target: Extent2D) -> TexCoordRect {
    match policy {
        CropPolicy::Stretch => TexCoordRect::FULL,
        CropPolicy::KeepAspectRatio => compute_crop(source, target).tex_coords(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-4;

    #[test]
    fn test_wider_target_crops_vertically() {
        let crop = compute_crop(Extent2D::new(1920, 1080), Extent2D::new(1024, 512));
        assert_eq!(crop.render_width, 1024);
        assert_eq!(crop.render_height, 576);
        assert_eq!(crop.offset_u, 0.0);
        assert!((crop.offset_v - 64.0 / 576.0 / 2.0).abs() < EPSILON);
        assert!((crop.offset_v - 0.0556).abs() < EPSILON);
    }

    #[test]
    fn test_taller_target_crops_horizontally() {
        let crop = compute_crop(Extent2D::new(1920, 1080), Extent2D::new(640, 480));
        // 1920 * 480 / 1080 = 853 (integer division)
        assert_eq!(crop.render_width, 853);
        assert_eq!(crop.render_height, 480);
        assert!((crop.offset_u - 213.0 / 853.0 / 2.0).abs() < EPSILON);
        assert_eq!(crop.offset_v, 0.0);
    }

    #[test]
    fn test_equal_aspect_ratio_has_no_offset() {
        let crop = compute_crop(Extent2D::new(1280, 720), Extent2D::new(640, 360));
        assert_eq!(crop.offset_u, 0.0);
        assert_eq!(crop.offset_v, 0.0);
        assert_eq!(crop.tex_coords(), TexCoordRect::FULL);
    }

    #[test]
    fn test_stretch_uses_full_rect() {
        let coords = tex_coords(
            CropPolicy::Stretch,
            Extent2D::new(1920, 1080),
            Extent2D::new(1024, 512),
        );
        assert_eq!(coords, TexCoordRect::FULL);
    }

    #[test]
    fn test_keep_aspect_ratio_corners() {
        let coords = tex_coords(
            CropPolicy::KeepAspectRatio,
            Extent2D::new(1920, 1080),
            Extent2D::new(1024, 512),
        );
        let offset_v = 64.0 / 576.0 / 2.0;
        assert_eq!(coords.u0, 0.0);
        assert_eq!(coords.u1, 1.0);
        assert!((coords.v0 - offset_v).abs() < EPSILON);
        assert!((coords.v1 - (1.0 - offset_v)).abs() < EPSILON);
    }

    #[test]
    fn test_empty_extent_is_not_cropped() {
        let crop = compute_crop(Extent2D::new(0, 0), Extent2D::new(64, 64));
        assert_eq!(crop.tex_coords(), TexCoordRect::FULL);
    }

    #[test]
    fn test_policy_from_flag() {
        assert_eq!(CropPolicy::from_keep_aspect_ratio(true), CropPolicy::KeepAspectRatio);
        assert_eq!(CropPolicy::from_keep_aspect_ratio(false), CropPolicy::Stretch);
    }
}
