//! UV generation: same-material atlas grouping and per-object unwraps.
//!
//! Objects that already carry UVs are left alone. With atlasing on, visible
//! objects sharing a primary material are joined (in world space) into one
//! ephemeral `ATLAS_<material>` object whose faces each get a cell of a
//! lightmap-style grid. Everything else gets an individual projection:
//! faces grouped into islands by dominant normal axis, each island
//! projected flat and the island rectangles row-packed into the unit square.

use crate::config::UvOptions;
use crate::scene::{Face, MeshData, Object, Scene};
use crate::shadow::WORKING_PREFIX;
use crate::types::ObjectRef;
use glam::{Vec2, Vec3};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Name of the UV layer created for generated coordinates.
pub const UV_LAYER: &str = "UVMap";

/// Name prefix of joined atlas objects.
pub const ATLAS_PREFIX: &str = "ATLAS_";

/// A rectangle within the unit UV square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRegion {
    /// U coordinate of the left edge (0-1).
    pub u_min: f32,
    /// V coordinate of the bottom edge (0-1).
    pub v_min: f32,
    /// U coordinate of the right edge (0-1).
    pub u_max: f32,
    /// V coordinate of the top edge (0-1).
    pub v_max: f32,
}

impl UvRegion {
    /// Get the width of this region in UV space.
    pub fn width(&self) -> f32 {
        self.u_max - self.u_min
    }

    /// Get the height of this region in UV space.
    pub fn height(&self) -> f32 {
        self.v_max - self.v_min
    }

    /// Transform a local UV coordinate (0-1) to the region.
    pub fn transform_uv(&self, u: f32, v: f32) -> [f32; 2] {
        [self.u_min + u * self.width(), self.v_min + v * self.height()]
    }

    fn overlaps(&self, other: &UvRegion) -> bool {
        self.u_min < other.u_max && other.u_min < self.u_max && self.v_min < other.v_max && other.v_min < self.v_max
    }
}

/// Counts from one unwrap pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UvStats {
    pub atlases_created: usize,
    pub atlased_objects: usize,
    pub unwrapped: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Atlas objects created, to be exported and reclaimed.
    pub atlas_objects: Vec<ObjectRef>,
    /// Mesh data of the atlas objects.
    pub atlas_meshes: Vec<String>,
    /// Targets merged into an atlas; they are not exported themselves.
    pub atlased_sources: Vec<ObjectRef>,
}

/// Generates UVs for working targets.
pub trait UvUnwrapper {
    fn unwrap(&self, scene: &mut Scene, targets: &[ObjectRef], options: &UvOptions) -> UvStats;
}

/// The built-in atlas grouping plus smart projection.
#[derive(Debug, Default)]
pub struct AtlasUnwrapper;

impl UvUnwrapper for AtlasUnwrapper {
    fn unwrap(&self, scene: &mut Scene, targets: &[ObjectRef], options: &UvOptions) -> UvStats {
        let mut stats = UvStats::default();
        let mut pending = Vec::new();

        for target in targets {
            match scene.object_mesh(target.as_str()) {
                Some(mesh) if mesh.has_uvs() => stats.skipped += 1,
                Some(_) => pending.push(target.clone()),
                None => {
                    warn!(object = %target, "No mesh to unwrap");
                    stats.failed += 1;
                }
            }
        }

        if options.atlasing {
            let mut groups: BTreeMap<String, Vec<ObjectRef>> = BTreeMap::new();
            for target in &pending {
                let Some(object) = scene.object(target.as_str()) else {
                    continue;
                };
                if object.hidden {
                    continue;
                }
                if let Some(material) = primary_material(scene, object) {
                    groups.entry(material).or_default().push(target.clone());
                }
            }

            for (material, members) in groups {
                if members.len() < options.min_group_size {
                    continue;
                }
                match build_atlas(scene, &material, &members, options.atlas_margin) {
                    Some((object, mesh)) => {
                        debug!(material = %material, members = members.len(), atlas = %object, "Created atlas");
                        stats.atlases_created += 1;
                        stats.atlased_objects += members.len();
                        stats.atlas_objects.push(object);
                        stats.atlas_meshes.push(mesh);
                        pending.retain(|t| !members.contains(t));
                        stats.atlased_sources.extend(members);
                    }
                    None => warn!(material = %material, "Atlas join produced no faces"),
                }
            }
        }

        for target in pending {
            let Some(mesh) = scene.object_mesh_mut(target.as_str()) else {
                stats.failed += 1;
                continue;
            };
            if smart_project(mesh, options.island_margin) {
                stats.unwrapped += 1;
            } else {
                stats.failed += 1;
            }
        }

        stats
    }
}

/// The material used by the most faces of an object.
fn primary_material(scene: &Scene, object: &Object) -> Option<String> {
    let mesh = scene.object_mesh(&object.name)?;
    let mut counts = vec![0usize; object.materials.len()];
    for face in &mesh.faces {
        if let Some(c) = counts.get_mut(face.material_index as usize) {
            *c += 1;
        }
    }
    let (best, _) = counts
        .iter()
        .enumerate()
        .filter(|(i, _)| object.materials[*i].is_some())
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))?;
    object.materials[best].clone()
}

/// Join `members` in world space into one atlas object.
fn build_atlas(scene: &mut Scene, material: &str, members: &[ObjectRef], margin: f32) -> Option<(ObjectRef, String)> {
    let mut joined = MeshData::new(format!("{}{}{}", WORKING_PREFIX, ATLAS_PREFIX, material));
    let mut slots: Vec<Option<String>> = Vec::new();

    for member in members {
        let Some(object) = scene.object(member.as_str()) else {
            continue;
        };
        let Some(mesh) = scene.object_mesh(member.as_str()) else {
            continue;
        };
        let offset = joined.positions.len() as u32;
        joined
            .positions
            .extend(mesh.positions.iter().map(|&p| object.transform.apply(p)));

        for face in &mesh.faces {
            let slot = object
                .materials
                .get(face.material_index as usize)
                .cloned()
                .flatten();
            let material_index = match slots.iter().position(|s| *s == slot) {
                Some(i) => i,
                None => {
                    slots.push(slot);
                    slots.len() - 1
                }
            };
            joined.faces.push(Face {
                vertices: face.vertices.iter().map(|v| v + offset).collect(),
                material_index: material_index as u32,
                uvs: Vec::new(),
            });
        }
    }

    if joined.faces.is_empty() {
        return None;
    }

    lightmap_pack(&mut joined, margin);

    let mesh_name = scene.add_mesh(joined);
    let mut atlas = Object::mesh(format!("{}{}", ATLAS_PREFIX, material), mesh_name.as_str());
    atlas.materials = slots;
    atlas.hidden = true;
    atlas.selectable = false;
    let object = scene.add_object(atlas);
    Some((object, mesh_name))
}

/// Ensure the mesh has exactly one fresh UV layer to write into.
fn reset_uv_layer(mesh: &mut MeshData) {
    mesh.uv_layers = vec![UV_LAYER.to_string()];
    for face in &mut mesh.faces {
        face.uvs = vec![vec![[0.0, 0.0]; face.vertices.len()]];
    }
}

/// Project a face onto its own plane, returning 2D corner coordinates.
fn flatten_face(mesh: &MeshData, face: &Face) -> Vec<Vec2> {
    let normal = Vec3::from(mesh.face_normal(face));
    let p0 = Vec3::from(mesh.positions[face.vertices[0] as usize]);
    let p1 = Vec3::from(mesh.positions[face.vertices[1] as usize]);
    let u_axis = (p1 - p0).normalize_or_zero();
    let v_axis = normal.cross(u_axis);
    face.vertices
        .iter()
        .map(|&v| {
            let d = Vec3::from(mesh.positions[v as usize]) - p0;
            Vec2::new(d.dot(u_axis), d.dot(v_axis))
        })
        .collect()
}

/// One grid cell per face, each face scaled uniformly to fit its cell.
pub fn lightmap_pack(mesh: &mut MeshData, margin: f32) {
    reset_uv_layer(mesh);
    let count = mesh.faces.len();
    if count == 0 {
        return;
    }
    let cols = (count as f32).sqrt().ceil() as usize;
    let cell = 1.0 / cols as f32;
    let inset = (margin * cell * 0.5).min(cell * 0.45);
    let inner = cell - 2.0 * inset;

    for i in 0..count {
        let flat = flatten_face(mesh, &mesh.faces[i]);
        let (min, max) = bounds(&flat);
        let extent = (max - min).max_element().max(f32::EPSILON);
        let origin = Vec2::new((i % cols) as f32 * cell + inset, (i / cols) as f32 * cell + inset);
        mesh.faces[i].uvs[0] = flat
            .iter()
            .map(|p| (origin + (*p - min) / extent * inner).to_array())
            .collect();
    }
}

fn bounds(points: &[Vec2]) -> (Vec2, Vec2) {
    let min = points.iter().copied().fold(Vec2::splat(f32::MAX), Vec2::min);
    let max = points.iter().copied().fold(Vec2::splat(f32::MIN), Vec2::max);
    (min, max)
}

/// Index 0-5 for +X, -X, +Y, -Y, +Z, -Z.
fn dominant_axis(normal: Vec3) -> usize {
    let abs = normal.abs();
    if abs.x >= abs.y && abs.x >= abs.z {
        if normal.x >= 0.0 { 0 } else { 1 }
    } else if abs.y >= abs.z {
        if normal.y >= 0.0 { 2 } else { 3 }
    } else if normal.z >= 0.0 {
        4
    } else {
        5
    }
}

fn project_axis(p: Vec3, axis: usize) -> Vec2 {
    match axis {
        0 => Vec2::new(-p.z, p.y),
        1 => Vec2::new(p.z, p.y),
        2 => Vec2::new(p.x, -p.z),
        3 => Vec2::new(p.x, p.z),
        4 => Vec2::new(p.x, p.y),
        _ => Vec2::new(-p.x, p.y),
    }
}

/// Group faces into islands: same dominant axis and connected through a shared edge.
fn islands(mesh: &MeshData) -> Vec<(usize, Vec<usize>)> {
    let axes: Vec<usize> = mesh
        .faces
        .iter()
        .map(|f| dominant_axis(Vec3::from(mesh.face_normal(f))))
        .collect();

    let mut edge_owner: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
    for (fi, face) in mesh.faces.iter().enumerate() {
        let n = face.vertices.len();
        for i in 0..n {
            let (a, b) = (face.vertices[i], face.vertices[(i + 1) % n]);
            edge_owner.entry((a.min(b), a.max(b))).or_default().push(fi);
        }
    }

    let mut island_of = vec![usize::MAX; mesh.faces.len()];
    let mut out = Vec::new();
    for seed in 0..mesh.faces.len() {
        if island_of[seed] != usize::MAX {
            continue;
        }
        let id = out.len();
        let mut members = vec![seed];
        island_of[seed] = id;
        let mut cursor = 0;
        while cursor < members.len() {
            let face = &mesh.faces[members[cursor]];
            cursor += 1;
            let n = face.vertices.len();
            for i in 0..n {
                let (a, b) = (face.vertices[i], face.vertices[(i + 1) % n]);
                for &other in &edge_owner[&(a.min(b), a.max(b))] {
                    if island_of[other] == usize::MAX && axes[other] == axes[seed] {
                        island_of[other] = id;
                        members.push(other);
                    }
                }
            }
        }
        out.push((axes[seed], members));
    }
    out
}

/// Individual unwrap. Returns false for meshes without faces.
pub fn smart_project(mesh: &mut MeshData, island_margin: f32) -> bool {
    if mesh.faces.is_empty() {
        return false;
    }
    reset_uv_layer(mesh);

    let islands = islands(mesh);
    let mut projected: Vec<Vec<Vec<Vec2>>> = Vec::with_capacity(islands.len());
    let mut sizes = Vec::with_capacity(islands.len());

    for (axis, faces) in &islands {
        let corners: Vec<Vec<Vec2>> = faces
            .iter()
            .map(|&fi| {
                mesh.faces[fi]
                    .vertices
                    .iter()
                    .map(|&v| project_axis(Vec3::from(mesh.positions[v as usize]), *axis))
                    .collect()
            })
            .collect();
        let all: Vec<Vec2> = corners.iter().flatten().copied().collect();
        let (min, max) = bounds(&all);
        let size = (max - min).max(Vec2::splat(f32::EPSILON));
        projected.push(
            corners
                .into_iter()
                .map(|c| c.into_iter().map(|p| p - min).collect())
                .collect(),
        );
        sizes.push((size.x, size.y));
    }

    let regions = pack_rects(&sizes, island_margin);

    for (((_, faces), corners), (region, &(w, h))) in islands
        .iter()
        .zip(&projected)
        .zip(regions.iter().zip(&sizes))
    {
        for (&fi, corner_uvs) in faces.iter().zip(corners) {
            mesh.faces[fi].uvs[0] = corner_uvs
                .iter()
                .map(|p| region.transform_uv(p.x / w, p.y / h))
                .collect();
        }
    }
    true
}

/// Row-pack rectangles (tallest first) into the unit square, scaled uniformly.
///
/// `margin` is the gap between rectangles in final UV units.
pub fn pack_rects(sizes: &[(f32, f32)], margin: f32) -> Vec<UvRegion> {
    if sizes.is_empty() {
        return Vec::new();
    }

    let total_area: f32 = sizes.iter().map(|(w, h)| w * h).sum();
    let widest = sizes.iter().map(|s| s.0).fold(0.0f32, f32::max);
    let gap = margin * total_area.sqrt().max(widest);

    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|&a, &b| sizes[b].1.total_cmp(&sizes[a].1));

    let padded_area: f32 = sizes.iter().map(|(w, h)| (w + gap) * (h + gap)).sum();
    let mut side = padded_area.sqrt().max(widest + gap);

    let positions = loop {
        if let Some(positions) = try_pack(sizes, &order, side, gap) {
            break positions;
        }
        side *= 1.1;
    };

    let scale = 1.0 / side;
    positions
        .iter()
        .zip(sizes)
        .map(|(&(x, y), &(w, h))| UvRegion {
            u_min: x * scale,
            v_min: y * scale,
            u_max: (x + w) * scale,
            v_max: (y + h) * scale,
        })
        .collect()
}

/// Try to pack rectangles into a square of the given side.
fn try_pack(sizes: &[(f32, f32)], order: &[usize], side: f32, gap: f32) -> Option<Vec<(f32, f32)>> {
    let mut positions = vec![(0.0, 0.0); sizes.len()];

    // Simple row-based packing
    let mut current_x = 0.0f32;
    let mut current_y = 0.0f32;
    let mut row_height = 0.0f32;

    for &i in order {
        let (w, h) = (sizes[i].0 + gap, sizes[i].1 + gap);

        // Check if we need to start a new row
        if current_x + w > side {
            current_x = 0.0;
            current_y += row_height;
            row_height = 0.0;
        }

        // Check if we've run out of space
        if current_y + h > side {
            return None;
        }

        positions[i] = (current_x + gap * 0.5, current_y + gap * 0.5);
        current_x += w;
        row_height = row_height.max(h);
    }

    Some(positions)
}

/// Whether any two regions overlap.
pub fn any_overlap(regions: &[UvRegion]) -> bool {
    regions
        .iter()
        .enumerate()
        .any(|(i, a)| regions[i + 1..].iter().any(|b| a.overlaps(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Material;
    use crate::types::Transform;

    fn in_unit_square(mesh: &MeshData) -> bool {
        mesh.faces
            .iter()
            .flat_map(|f| f.uvs[0].iter())
            .all(|uv| (0.0..=1.0 + 1e-5).contains(&uv[0]) && (0.0..=1.0 + 1e-5).contains(&uv[1]))
    }

    #[test]
    fn test_pack_rects_fit_without_overlap() {
        let sizes = vec![(2.0, 1.0), (1.0, 1.0), (0.5, 3.0), (1.0, 0.25), (0.1, 0.1)];
        let regions = pack_rects(&sizes, 0.02);
        assert_eq!(regions.len(), 5);
        assert!(!any_overlap(&regions));
        for r in &regions {
            assert!(r.u_min >= 0.0 && r.v_min >= 0.0 && r.u_max <= 1.0 + 1e-5 && r.v_max <= 1.0 + 1e-5);
        }
        // Uniform scale keeps aspect ratios.
        assert!((regions[0].width() / regions[0].height() - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_smart_project_cube() {
        let mut cube = MeshData::cube("Cube", 1.0);
        assert!(smart_project(&mut cube, 0.02));
        assert_eq!(cube.uv_layers, vec![UV_LAYER.to_string()]);
        assert!(cube.validate().is_ok());
        assert!(in_unit_square(&cube));
    }

    #[test]
    fn test_lightmap_pack() {
        let mut sphere = MeshData::uv_sphere("Sphere", 8, 6, 1.0);
        lightmap_pack(&mut sphere, 0.05);
        assert!(sphere.validate().is_ok());
        assert!(in_unit_square(&sphere));
    }

    fn two_crates() -> Scene {
        let mut scene = Scene::new("Test");
        scene.add_material(Material::principled("Crate", None));
        for (i, name) in ["CrateA", "CrateB"].iter().enumerate() {
            let mesh = scene.add_mesh(MeshData::cube(format!("{}Mesh", name), 0.5));
            scene.add_object(
                Object::mesh(*name, mesh.as_str())
                    .with_materials(&["Crate"])
                    .with_transform(Transform::from_translation([i as f32 * 3.0, 0.0, 0.0])),
            );
        }
        scene
    }

    #[test]
    fn test_atlas_groups_same_material() {
        let mut scene = two_crates();
        let targets = vec![ObjectRef::from("CrateA"), ObjectRef::from("CrateB")];
        let stats = AtlasUnwrapper.unwrap(&mut scene, &targets, &UvOptions::default());

        assert_eq!(stats.atlases_created, 1);
        assert_eq!(stats.atlased_objects, 2);
        assert_eq!(stats.unwrapped, 0);
        assert_eq!(stats.atlas_objects, vec![ObjectRef::from("ATLAS_Crate")]);
        assert_eq!(stats.atlas_meshes, vec!["SHADOW_ATLAS_Crate".to_string()]);

        let atlas = scene.object_mesh("ATLAS_Crate").unwrap();
        assert_eq!(atlas.face_count(), 12);
        assert!(atlas.has_uvs());
        assert!(in_unit_square(atlas));
        // World space: the second crate sits 3 units along X.
        assert!(atlas.positions.iter().any(|p| p[0] > 3.0));
        assert!(!scene.object_mesh("CrateA").unwrap().has_uvs());
    }

    #[test]
    fn test_group_below_minimum_is_unwrapped_individually() {
        let mut scene = two_crates();
        let targets = vec![ObjectRef::from("CrateA"), ObjectRef::from("CrateB")];
        let options = UvOptions {
            min_group_size: 3,
            ..UvOptions::default()
        };
        let stats = AtlasUnwrapper.unwrap(&mut scene, &targets, &options);
        assert_eq!(stats.atlases_created, 0);
        assert_eq!(stats.unwrapped, 2);
        assert!(scene.object_mesh("CrateA").unwrap().has_uvs());
    }

    #[test]
    fn test_existing_uvs_are_skipped() {
        let mut scene = two_crates();
        scene.object_mesh_mut("CrateA").unwrap().add_uv_layer("UVMap");
        let targets = vec![ObjectRef::from("CrateA")];
        let stats = AtlasUnwrapper.unwrap(&mut scene, &targets, &UvOptions::default());
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.unwrapped, 0);
    }
}
