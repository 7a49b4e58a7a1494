//! Asset loading for the frameslot demo.
//!
//! This crate handles loading of external assets:
//! - Images decoded to tightly packed RGBA8
//! - Triangle meshes from glTF files
//!
//! Assets are loaded once at startup through the [`AssetLoader`] trait, so
//! tests and embedders can substitute their own source.

mod error;
mod images;
mod loader;
mod mesh;

pub use error::{ResourceError, ResourceResult};
pub use images::ImageData;
pub use loader::{AssetLoader, FsAssetLoader};
pub use mesh::MeshData;
