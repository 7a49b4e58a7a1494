//! Integration tests for filesystem asset loading.

use std::path::Path;

use frameslot_resources::{AssetLoader, FsAssetLoader, ResourceError};
use glam::Vec3;

const TRIANGLE_GLTF: &str = r#"{
  "asset": { "version": "2.0" },
  "scene": 0,
  "scenes": [{ "nodes": [0] }],
  "nodes": [{ "mesh": 0 }],
  "meshes": [{
    "name": "triangle",
    "primitives": [{ "attributes": { "POSITION": 1 }, "indices": 0 }]
  }],
  "buffers": [{
    "uri": "data:application/octet-stream;base64,AAABAAIAAAAAAAAAAAAAAAAAAAAAAIA/AAAAAAAAAAAAAAAAAACAPwAAAAA=",
    "byteLength": 44
  }],
  "bufferViews": [
    { "buffer": 0, "byteOffset": 0, "byteLength": 6, "target": 34963 },
    { "buffer": 0, "byteOffset": 8, "byteLength": 36, "target": 34962 }
  ],
  "accessors": [
    { "bufferView": 0, "componentType": 5123, "count": 3, "type": "SCALAR" },
    {
      "bufferView": 1, "componentType": 5126, "count": 3, "type": "VEC3",
      "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]
    }
  ]
}"#;

#[test]
fn test_png_loads_as_rgba() {
    let dir = tempfile::tempdir().unwrap();
    image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]))
        .save(dir.path().join("backdrop.png"))
        .unwrap();

    let loader = FsAssetLoader::new(dir.path());
    let image = loader.load_image(Path::new("backdrop.png")).unwrap();

    assert_eq!((image.width, image.height), (3, 2));
    assert_eq!(image.pixels.len(), 3 * 2 * 4);
    assert!(image.pixels.chunks_exact(4).all(|p| p == [10, 20, 30, 255]));
}

#[test]
fn test_missing_asset_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let loader = FsAssetLoader::new(dir.path());

    let err = loader.load_image(Path::new("missing.png")).unwrap_err();
    assert!(matches!(err, ResourceError::NotFound(path) if path.ends_with("missing.png")));
}

#[test]
fn test_corrupt_image_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

    let loader = FsAssetLoader::new(dir.path());
    let err = loader.load_image(Path::new("broken.png")).unwrap_err();
    assert!(matches!(err, ResourceError::Image { .. }));
    assert!(err.to_string().contains("broken.png"));
}

#[test]
fn test_gltf_triangle_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("triangle.gltf");
    std::fs::write(&path, TRIANGLE_GLTF).unwrap();

    // Absolute paths bypass the loader root
    let loader = FsAssetLoader::default();
    let mesh = loader.load_mesh(&path).unwrap();

    assert_eq!(mesh.positions, vec![Vec3::ZERO, Vec3::X, Vec3::Y]);
    assert_eq!(mesh.indices, vec![0, 1, 2]);
    assert_eq!(mesh.normals, vec![Vec3::ZERO; 3]);
    assert_eq!(mesh.tex_coords, vec![[0.0, 0.0]; 3]);
    assert_eq!(mesh.aabb_max, Vec3::new(1.0, 1.0, 0.0));
    assert_eq!(mesh.triangle_count(), 1);
}

#[test]
fn test_gltf_without_meshes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("empty.gltf"),
        r#"{ "asset": { "version": "2.0" } }"#,
    )
    .unwrap();

    let loader = FsAssetLoader::new(dir.path());
    assert!(matches!(
        loader.load_mesh(Path::new("empty.gltf")),
        Err(ResourceError::NoMeshes(_))
    ));
}
