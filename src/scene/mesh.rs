//! Polygon mesh data blocks.

use crate::error::{BridgeError, Result};
use crate::types::BoundingBox;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// A polygon face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    /// Vertex indices, counter-clockwise when seen from the front.
    pub vertices: Vec<u32>,
    /// Index into the owning object's material slots.
    #[serde(default)]
    pub material_index: u32,
    /// Face-corner UVs, one list per UV layer, each with one entry per corner.
    #[serde(default)]
    pub uvs: Vec<Vec<[f32; 2]>>,
}

impl Face {
    pub fn new(vertices: Vec<u32>) -> Self {
        Self {
            vertices,
            material_index: 0,
            uvs: Vec::new(),
        }
    }

    pub fn with_material(mut self, material_index: u32) -> Self {
        self.material_index = material_index;
        self
    }

    pub fn is_triangle(&self) -> bool {
        self.vertices.len() == 3
    }
}

/// A mesh data block: positions plus polygon faces.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshData {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub faces: Vec<Face>,
    /// Names of the UV layers carried by every face.
    #[serde(default)]
    pub uv_layers: Vec<String>,
}

impl MeshData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_geometry(name: impl Into<String>, positions: Vec<[f32; 3]>, faces: Vec<Face>) -> Self {
        Self {
            name: name.into(),
            positions,
            faces,
            uv_layers: Vec::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Number of triangles after fan triangulation.
    pub fn triangle_count(&self) -> usize {
        self.faces.iter().map(|f| f.vertices.len().saturating_sub(2)).sum()
    }

    pub fn has_uvs(&self) -> bool {
        !self.uv_layers.is_empty()
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(self.positions.iter().copied())
    }

    /// Check indices and UV arity.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: String| BridgeError::CorruptMesh {
            name: self.name.clone(),
            reason,
        };
        let vertex_count = self.positions.len() as u32;

        for (i, p) in self.positions.iter().enumerate() {
            if p.iter().any(|c| !c.is_finite()) {
                return Err(corrupt(format!("vertex {} is not finite", i)));
            }
        }

        for (i, face) in self.faces.iter().enumerate() {
            if face.vertices.len() < 3 {
                return Err(corrupt(format!("face {} has {} corners", i, face.vertices.len())));
            }
            if let Some(&v) = face.vertices.iter().find(|&&v| v >= vertex_count) {
                return Err(corrupt(format!("face {} references vertex {} of {}", i, v, vertex_count)));
            }
            if face.uvs.len() != self.uv_layers.len() {
                return Err(corrupt(format!(
                    "face {} has {} UV layers, mesh has {}",
                    i,
                    face.uvs.len(),
                    self.uv_layers.len()
                )));
            }
            if face.uvs.iter().any(|layer| layer.len() != face.vertices.len()) {
                return Err(corrupt(format!("face {} has mismatched UV corners", i)));
            }
        }

        Ok(())
    }

    /// Unit normal of a face (Newell's method), zero for degenerate faces.
    pub fn face_normal(&self, face: &Face) -> [f32; 3] {
        let mut n = Vec3::ZERO;
        let count = face.vertices.len();
        for i in 0..count {
            let a = Vec3::from(self.positions[face.vertices[i] as usize]);
            let b = Vec3::from(self.positions[face.vertices[(i + 1) % count] as usize]);
            n.x += (a.y - b.y) * (a.z + b.z);
            n.y += (a.z - b.z) * (a.x + b.x);
            n.z += (a.x - b.x) * (a.y + b.y);
        }
        n.normalize_or_zero().to_array()
    }

    /// Area of a face.
    pub fn face_area(&self, face: &Face) -> f32 {
        let count = face.vertices.len();
        if count < 3 {
            return 0.0;
        }
        let origin = Vec3::from(self.positions[face.vertices[0] as usize]);
        let mut area = Vec3::ZERO;
        for i in 1..count - 1 {
            let b = Vec3::from(self.positions[face.vertices[i] as usize]);
            let c = Vec3::from(self.positions[face.vertices[i + 1] as usize]);
            area += (b - origin).cross(c - origin);
        }
        area.length() * 0.5
    }

    /// Smooth per-vertex normals, area weighted.
    pub fn vertex_normals(&self) -> Vec<[f32; 3]> {
        let mut normals = vec![Vec3::ZERO; self.positions.len()];
        for face in &self.faces {
            let n = Vec3::from(self.face_normal(face)) * self.face_area(face).max(1e-12);
            for &v in &face.vertices {
                normals[v as usize] += n;
            }
        }
        normals
            .into_iter()
            .map(|n| {
                let n = n.normalize_or_zero();
                if n == Vec3::ZERO {
                    [0.0, 1.0, 0.0]
                } else {
                    n.to_array()
                }
            })
            .collect()
    }

    /// Fan-triangulate every face with more than three corners.
    ///
    /// Returns the number of faces that were split.
    pub fn triangulate(&mut self) -> usize {
        if self.faces.iter().all(Face::is_triangle) {
            return 0;
        }

        let mut split = 0;
        let mut faces = Vec::with_capacity(self.triangle_count());
        for face in self.faces.drain(..) {
            if face.vertices.len() == 3 {
                faces.push(face);
                continue;
            }
            split += 1;
            for i in 1..face.vertices.len() - 1 {
                let corners = [0, i, i + 1];
                faces.push(Face {
                    vertices: corners.iter().map(|&c| face.vertices[c]).collect(),
                    material_index: face.material_index,
                    uvs: face
                        .uvs
                        .iter()
                        .map(|layer| corners.iter().map(|&c| layer[c]).collect())
                        .collect(),
                });
            }
        }
        self.faces = faces;
        split
    }

    /// Drop vertices no face references and compact the index space.
    ///
    /// Returns the number of vertices removed.
    pub fn remove_loose_vertices(&mut self) -> usize {
        let mut used = vec![false; self.positions.len()];
        for face in &self.faces {
            for &v in &face.vertices {
                used[v as usize] = true;
            }
        }

        let mut remap = vec![u32::MAX; self.positions.len()];
        let mut positions = Vec::with_capacity(self.positions.len());
        for (i, p) in self.positions.iter().enumerate() {
            if used[i] {
                remap[i] = positions.len() as u32;
                positions.push(*p);
            }
        }

        let removed = self.positions.len() - positions.len();
        if removed > 0 {
            self.positions = positions;
            for face in &mut self.faces {
                for v in &mut face.vertices {
                    *v = remap[*v as usize];
                }
            }
        }
        removed
    }

    /// Add an empty UV layer, filling every corner with zero.
    pub fn add_uv_layer(&mut self, name: impl Into<String>) {
        self.uv_layers.push(name.into());
        for face in &mut self.faces {
            face.uvs.push(vec![[0.0, 0.0]; face.vertices.len()]);
        }
    }

    /// A closed, triangulated UV sphere, handy for tests and demos.
    ///
    /// Produces `2 * segments * (rings - 1)` triangles.
    pub fn uv_sphere(name: impl Into<String>, segments: u32, rings: u32, radius: f32) -> Self {
        let mut positions = vec![[0.0, radius, 0.0]];
        for ring in 1..rings {
            let phi = std::f32::consts::PI * ring as f32 / rings as f32;
            for seg in 0..segments {
                let theta = std::f32::consts::TAU * seg as f32 / segments as f32;
                positions.push([
                    radius * phi.sin() * theta.cos(),
                    radius * phi.cos(),
                    radius * phi.sin() * theta.sin(),
                ]);
            }
        }
        let south = positions.len() as u32;
        positions.push([0.0, -radius, 0.0]);

        let ring_start = |ring: u32| 1 + (ring - 1) * segments;
        let mut faces = Vec::new();
        for seg in 0..segments {
            let next = (seg + 1) % segments;
            faces.push(Face::new(vec![0, ring_start(1) + next, ring_start(1) + seg]));
        }
        for ring in 1..rings - 1 {
            for seg in 0..segments {
                let next = (seg + 1) % segments;
                let a = ring_start(ring) + seg;
                let b = ring_start(ring) + next;
                let c = ring_start(ring + 1) + next;
                let d = ring_start(ring + 1) + seg;
                faces.push(Face::new(vec![a, b, c]));
                faces.push(Face::new(vec![a, c, d]));
            }
        }
        for seg in 0..segments {
            let next = (seg + 1) % segments;
            faces.push(Face::new(vec![south, ring_start(rings - 1) + seg, ring_start(rings - 1) + next]));
        }

        Self::with_geometry(name, positions, faces)
    }

    /// An axis-aligned unit cube made of six quads.
    pub fn cube(name: impl Into<String>, half: f32) -> Self {
        let h = half;
        let positions = vec![
            [-h, -h, -h],
            [h, -h, -h],
            [h, h, -h],
            [-h, h, -h],
            [-h, -h, h],
            [h, -h, h],
            [h, h, h],
            [-h, h, h],
        ];
        let faces = vec![
            Face::new(vec![0, 3, 2, 1]),
            Face::new(vec![4, 5, 6, 7]),
            Face::new(vec![0, 1, 5, 4]),
            Face::new(vec![2, 3, 7, 6]),
            Face::new(vec![1, 2, 6, 5]),
            Face::new(vec![0, 4, 7, 3]),
        ];
        Self::with_geometry(name, positions, faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uv_sphere_face_count() {
        let sphere = MeshData::uv_sphere("Sphere", 25, 21, 1.0);
        assert_eq!(sphere.face_count(), 1000);
        assert!(sphere.validate().is_ok());
    }

    #[test]
    fn test_triangulate_cube() {
        let mut cube = MeshData::cube("Cube", 0.5);
        cube.add_uv_layer("UVMap");
        assert_eq!(cube.triangulate(), 6);
        assert_eq!(cube.face_count(), 12);
        assert!(cube.faces.iter().all(|f| f.uvs[0].len() == 3));
        assert!(cube.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_index() {
        let mesh = MeshData::with_geometry("Bad", vec![[0.0; 3]; 3], vec![Face::new(vec![0, 1, 7])]);
        assert!(matches!(mesh.validate(), Err(BridgeError::CorruptMesh { .. })));

        let mesh = MeshData::with_geometry("Short", vec![[0.0; 3]; 3], vec![Face::new(vec![0, 1])]);
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_uv_mismatch() {
        let mut mesh = MeshData::cube("Cube", 1.0);
        mesh.uv_layers.push("UVMap".to_string());
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_remove_loose_vertices() {
        let mut mesh = MeshData::with_geometry(
            "Loose",
            vec![[0.0, 0.0, 0.0], [9.0, 9.0, 9.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![Face::new(vec![0, 2, 3])],
        );
        assert_eq!(mesh.remove_loose_vertices(), 1);
        assert_eq!(mesh.faces[0].vertices, vec![0, 1, 2]);
    }

    #[test]
    fn test_cube_normals_point_outward() {
        let cube = MeshData::cube("Cube", 1.0);
        let top = &cube.faces[1];
        assert_eq!(cube.face_normal(top), [0.0, 0.0, 1.0]);
        assert!((cube.face_area(top) - 4.0).abs() < 1e-5);
    }
}
