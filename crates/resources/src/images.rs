//! Image decoding.

use std::path::Path;

use tracing::debug;

use crate::error::{ResourceError, ResourceResult};

/// Decoded image, tightly packed RGBA8 rows from top to bottom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl ImageData {
    /// Decodes the image at `path`, converting any color type to RGBA8.
    pub fn decode(path: &Path) -> ResourceResult<Self> {
        let decoded = image::open(path).map_err(|source| ResourceError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        debug!("Decoded {}: {}x{}", path.display(), width, height);

        Ok(Self {
            width,
            height,
            pixels: rgba.into_raw(),
        })
    }

    /// Converts to one luma byte per pixel with the weights
    /// `0.299 R + 0.587 G + 0.114 B`.
    pub fn to_luma(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(4)
            .map(|p| {
                let luma = 0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2]);
                luma.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}
