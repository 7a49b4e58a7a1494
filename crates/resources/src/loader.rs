//! Asset sources.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ResourceError, ResourceResult};
use crate::images::ImageData;
use crate::mesh::MeshData;

/// Source of decoded assets.
pub trait AssetLoader {
    /// Loads an image as RGBA8.
    fn load_image(&self, path: &Path) -> ResourceResult<ImageData>;

    /// Loads every triangle primitive of a mesh file.
    fn load_mesh(&self, path: &Path) -> ResourceResult<MeshData>;
}

/// Loads assets from the filesystem, resolving relative paths against a
/// root directory.
#[derive(Clone, Debug)]
pub struct FsAssetLoader {
    root: PathBuf,
}

impl FsAssetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `path` against the root and checks that it exists.
    pub fn resolve(&self, path: &Path) -> ResourceResult<PathBuf> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        if resolved.is_file() {
            Ok(resolved)
        } else {
            Err(ResourceError::NotFound(resolved))
        }
    }
}

impl Default for FsAssetLoader {
    fn default() -> Self {
        Self::new(".")
    }
}

impl AssetLoader for FsAssetLoader {
    fn load_image(&self, path: &Path) -> ResourceResult<ImageData> {
        let path = self.resolve(path)?;
        let image = ImageData::decode(&path)?;
        info!(
            "Loaded image {} ({}x{})",
            path.display(),
            image.width,
            image.height
        );
        Ok(image)
    }

    fn load_mesh(&self, path: &Path) -> ResourceResult<MeshData> {
        let path = self.resolve(path)?;
        let mesh = MeshData::load_gltf(&path)?;
        info!(
            "Loaded mesh {} ({} vertices)",
            path.display(),
            mesh.vertex_count()
        );
        Ok(mesh)
    }
}
