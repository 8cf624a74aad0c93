//! Quadric error metric simplification through meshoptimizer.
//!
//! Corners are split into render vertices wherever the material or a UV
//! differs, so meshopt sees attribute seams as borders and keeps them. It
//! only ever collapses onto existing vertices; positions are kept as they
//! are and the surviving triangles are mapped back onto them.

use super::collapse::{collapse_to, ShortestEdgePolicy};
use super::Simplifier;
use crate::scene::{Face, MeshData};
use std::collections::HashMap;
use tracing::debug;

/// Error bound handed to meshopt, relative to the mesh extent; 1.0 never stops early.
const TARGET_ERROR: f32 = 1.0;

/// One distinct (position, material, corner UVs) combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RenderKey {
    position: u32,
    material: u32,
    uvs: Vec<[u32; 2]>,
}

/// Mesh split into render vertices, with one index triple per triangle.
struct RenderMesh {
    keys: Vec<RenderKey>,
    uvs: Vec<Vec<[f32; 2]>>,
    positions: Vec<[f32; 3]>,
    indices: Vec<u32>,
}

impl RenderMesh {
    fn new(mesh: &MeshData) -> Self {
        let mut lookup: HashMap<RenderKey, u32> = HashMap::new();
        let mut render = RenderMesh {
            keys: Vec::new(),
            uvs: Vec::new(),
            positions: Vec::new(),
            indices: Vec::with_capacity(mesh.faces.len() * 3),
        };

        for face in &mesh.faces {
            for (corner, &v) in face.vertices.iter().enumerate() {
                let uvs: Vec<[f32; 2]> = face
                    .uvs
                    .iter()
                    .map(|layer| layer.get(corner).copied().unwrap_or([0.0, 0.0]))
                    .collect();
                let key = RenderKey {
                    position: v,
                    material: face.material_index,
                    uvs: uvs.iter().map(|uv| [uv[0].to_bits(), uv[1].to_bits()]).collect(),
                };
                let index = *lookup.entry(key.clone()).or_insert_with(|| {
                    render.keys.push(key);
                    render.uvs.push(uvs);
                    render.positions.push(mesh.positions[v as usize]);
                    (render.positions.len() - 1) as u32
                });
                render.indices.push(index);
            }
        }
        render
    }

    /// Rebuild faces from simplified indices, dropping any that collapsed onto one position.
    fn faces(&self, indices: &[u32]) -> Vec<Face> {
        indices
            .chunks_exact(3)
            .filter_map(|tri| {
                let keys: Vec<&RenderKey> = tri.iter().map(|&i| &self.keys[i as usize]).collect();
                let (a, b, c) = (keys[0].position, keys[1].position, keys[2].position);
                if a == b || b == c || a == c {
                    return None;
                }
                let layers = self.uvs[tri[0] as usize].len();
                let uvs = (0..layers)
                    .map(|layer| tri.iter().map(|&i| self.uvs[i as usize][layer]).collect())
                    .collect();
                Some(Face {
                    vertices: vec![a, b, c],
                    material_index: keys[0].material,
                    uvs,
                })
            })
            .collect()
    }
}

/// meshopt quadric simplifier; any shortfall is finished by edge collapse.
#[derive(Debug, Default)]
pub struct QuadricSimplifier;

impl Simplifier for QuadricSimplifier {
    fn name(&self) -> &'static str {
        "quadric"
    }

    fn simplify(&self, mesh: &mut MeshData, target_faces: usize) -> Result<usize, String> {
        let target_faces = target_faces.max(1);
        if mesh.faces.len() <= target_faces {
            return Ok(mesh.faces.len());
        }

        let render = RenderMesh::new(mesh);
        let adapter = meshopt::VertexDataAdapter::new(meshopt::typed_to_bytes(&render.positions), 12, 0)
            .map_err(|e| e.to_string())?;
        let indices = meshopt::simplify(
            &render.indices,
            &adapter,
            target_faces * 3,
            TARGET_ERROR,
            meshopt::SimplifyOptions::None,
            None,
        );

        let faces = render.faces(&indices);
        if faces.is_empty() {
            return Err("meshopt removed every triangle".to_string());
        }
        mesh.faces = faces;
        mesh.remove_loose_vertices();

        if mesh.faces.len() > target_faces {
            debug!(mesh = %mesh.name, faces = mesh.faces.len(), target_faces, "Finishing with edge collapse");
            return Ok(collapse_to(mesh, target_faces, &mut ShortestEdgePolicy::default()));
        }
        Ok(mesh.faces.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simplify_sphere_keeps_valid_geometry() {
        let mut mesh = MeshData::uv_sphere("Sphere", 25, 21, 1.0);
        let remaining = QuadricSimplifier.simplify(&mut mesh, 200).unwrap();
        assert!(remaining <= 200);
        assert_eq!(mesh.face_count(), remaining);
        assert!(mesh.validate().is_ok());
        assert!(mesh.faces.iter().all(Face::is_triangle));
    }

    #[test]
    fn test_materials_and_uvs_follow_corners() {
        let mut mesh = MeshData::uv_sphere("Sphere", 16, 12, 1.0);
        mesh.add_uv_layer("UVMap");
        let half = mesh.faces.len() / 2;
        for (i, face) in mesh.faces.iter_mut().enumerate() {
            face.material_index = u32::from(i >= half);
            let v = if i >= half { 0.75 } else { 0.25 };
            face.uvs[0] = vec![[0.5, v]; 3];
        }

        let remaining = QuadricSimplifier.simplify(&mut mesh, 100).unwrap();
        assert_eq!(mesh.face_count(), remaining);
        for face in &mesh.faces {
            assert_eq!(face.uvs.len(), 1);
            assert_eq!(face.uvs[0].len(), 3);
            let expected = if face.material_index == 1 { 0.75 } else { 0.25 };
            assert!(face.uvs[0].iter().all(|uv| uv[1] == expected));
        }
    }

    #[test]
    fn test_already_small_mesh_untouched() {
        let mut mesh = MeshData::uv_sphere("Sphere", 8, 6, 1.0);
        let before = mesh.clone();
        assert_eq!(QuadricSimplifier.simplify(&mut mesh, 1000).unwrap(), before.face_count());
        assert_eq!(mesh, before);
    }
}
