//! Error types for asset loading.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for asset loading operations.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The asset path does not exist.
    #[error("Asset not found: {0}")]
    NotFound(PathBuf),

    /// The image could not be decoded.
    #[error("Failed to decode image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The glTF document or one of its buffers could not be read.
    #[error("Failed to load glTF file '{path}': {source}")]
    Gltf {
        path: PathBuf,
        #[source]
        source: gltf::Error,
    },

    /// glTF file contains no triangle meshes.
    #[error("glTF file '{0}' contains no meshes")]
    NoMeshes(PathBuf),

    /// A mesh primitive has no position data.
    #[error("Mesh '{mesh}' in '{path}' has a primitive without positions")]
    MissingPositions { path: PathBuf, mesh: String },

    /// Index data points past the end of the vertex data.
    #[error("Mesh '{mesh}' in '{path}' references vertex {index} of {count}")]
    IndexOutOfRange {
        path: PathBuf,
        mesh: String,
        index: u32,
        count: usize,
    },
}

/// Result type alias for asset operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
