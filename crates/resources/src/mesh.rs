//! Triangle mesh loading from glTF files.

use std::path::Path;

use glam::Vec3;
use tracing::{debug, warn};

use crate::error::{ResourceError, ResourceResult};

/// Indexed triangle mesh with all primitives of a document merged.
///
/// `normals` and `tex_coords` always have one entry per position; attributes
/// missing from the file are zero-filled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tex_coords: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    /// Axis-aligned bounding box minimum
    pub aabb_min: Vec3,
    /// Axis-aligned bounding box maximum
    pub aabb_max: Vec3,
}

impl MeshData {
    /// Loads every mesh primitive of a `.gltf` or `.glb` file.
    pub fn load_gltf(path: &Path) -> ResourceResult<Self> {
        let (document, buffers, _images) =
            gltf::import(path).map_err(|source| ResourceError::Gltf {
                path: path.to_path_buf(),
                source,
            })?;

        let mut mesh = Self::default();
        let mut primitives = 0usize;

        for gltf_mesh in document.meshes() {
            let name = gltf_mesh
                .name()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("#{}", gltf_mesh.index()));

            for primitive in gltf_mesh.primitives() {
                if primitive.mode() != gltf::mesh::Mode::Triangles {
                    warn!("Skipping non-triangle primitive in mesh '{}'", name);
                    continue;
                }

                let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()].0[..]));
                let positions: Vec<Vec3> = reader
                    .read_positions()
                    .ok_or_else(|| ResourceError::MissingPositions {
                        path: path.to_path_buf(),
                        mesh: name.clone(),
                    })?
                    .map(Vec3::from)
                    .collect();
                let count = positions.len();

                let normals: Vec<Vec3> = match reader.read_normals() {
                    Some(normals) => normals.map(Vec3::from).collect(),
                    None => vec![Vec3::ZERO; count],
                };
                let tex_coords: Vec<[f32; 2]> = match reader.read_tex_coords(0) {
                    Some(coords) => coords.into_f32().collect(),
                    None => vec![[0.0; 2]; count],
                };
                let indices: Vec<u32> = match reader.read_indices() {
                    Some(indices) => indices.into_u32().collect(),
                    None => (0..count as u32).collect(),
                };

                if let Some(&index) = indices.iter().find(|&&i| i as usize >= count) {
                    return Err(ResourceError::IndexOutOfRange {
                        path: path.to_path_buf(),
                        mesh: name,
                        index,
                        count,
                    });
                }

                mesh.append(positions, normals, tex_coords, &indices);
                primitives += 1;
            }
        }

        if primitives == 0 {
            return Err(ResourceError::NoMeshes(path.to_path_buf()));
        }

        debug!(
            "Loaded {}: {} primitives, {} vertices, {} triangles",
            path.display(),
            primitives,
            mesh.vertex_count(),
            mesh.triangle_count()
        );

        Ok(mesh)
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn append(
        &mut self,
        positions: Vec<Vec3>,
        mut normals: Vec<Vec3>,
        mut tex_coords: Vec<[f32; 2]>,
        indices: &[u32],
    ) {
        let base = self.positions.len() as u32;
        let count = positions.len();
        normals.resize(count, Vec3::ZERO);
        tex_coords.resize(count, [0.0; 2]);

        let (min, max) = positions.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), &p| (min.min(p), max.max(p)),
        );
        if self.positions.is_empty() {
            self.aabb_min = min;
            self.aabb_max = max;
        } else if count > 0 {
            self.aabb_min = self.aabb_min.min(min);
            self.aabb_max = self.aabb_max.max(max);
        }

        self.positions.extend(positions);
        self.normals.extend(normals);
        self.tex_coords.extend(tex_coords);
        self.indices.extend(indices.iter().map(|&i| i + base));
    }
}
