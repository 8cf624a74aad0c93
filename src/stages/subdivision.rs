//! Subdivision level clamping and export-time subdivision.

use crate::config::SubdivisionOptions;
use crate::scene::{Face, MeshData, Modifier, Scene};
use crate::types::ObjectRef;
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Original levels of one lowered modifier.
#[derive(Debug, Clone, PartialEq)]
pub struct SubdivisionOverrideRecord {
    pub object: ObjectRef,
    pub modifier: String,
    pub original_levels: u32,
    pub original_render_levels: u32,
}

/// Lower every subdivision modifier above the cap on the given objects.
pub fn apply_override(
    scene: &mut Scene,
    sources: &[ObjectRef],
    options: &SubdivisionOptions,
) -> Vec<SubdivisionOverrideRecord> {
    let mut records = Vec::new();

    for source in sources {
        if options.excluded.iter().any(|e| e == source.as_str()) {
            continue;
        }
        let cap = options
            .overrides
            .get(source.as_str())
            .copied()
            .unwrap_or(options.level);
        let Some(object) = scene.object_mut(source.as_str()) else {
            continue;
        };

        for modifier in &mut object.modifiers {
            let Modifier::Subdivision {
                name,
                levels,
                render_levels,
            } = modifier
            else {
                continue;
            };
            if *levels <= cap && *render_levels <= cap {
                continue;
            }
            records.push(SubdivisionOverrideRecord {
                object: source.clone(),
                modifier: name.clone(),
                original_levels: *levels,
                original_render_levels: *render_levels,
            });
            *levels = (*levels).min(cap);
            *render_levels = (*render_levels).min(cap);
            debug!(object = %source, modifier = %name, cap, "Lowered subdivision level");
        }
    }

    records
}

/// Put the original levels back, resolving objects and modifiers by name.
pub fn restore(scene: &mut Scene, records: &[SubdivisionOverrideRecord]) -> usize {
    let mut restored = 0;
    for record in records {
        let modifier = scene
            .object_mut(record.object.as_str())
            .and_then(|o| o.modifiers.iter_mut().find(|m| m.name() == record.modifier));
        match modifier {
            Some(Modifier::Subdivision {
                levels,
                render_levels,
                ..
            }) => {
                *levels = record.original_levels;
                *render_levels = record.original_render_levels;
                restored += 1;
            }
            _ => warn!(
                object = %record.object,
                modifier = %record.modifier,
                "Subdivision modifier vanished before restore"
            ),
        }
    }
    restored
}

/// Total viewport subdivision levels of an object's modifier stack.
pub fn viewport_levels(modifiers: &[Modifier]) -> u32 {
    modifiers
        .iter()
        .map(|m| match m {
            Modifier::Subdivision { levels, .. } => *levels,
            Modifier::Other { .. } => 0,
        })
        .sum()
}

/// Linear midpoint subdivision, `levels` times.
///
/// Each pass splits every n-gon into n quads around its centroid. UVs and
/// material indices carry over; positions are not smoothed.
pub fn subdivide(mesh: &MeshData, levels: u32) -> MeshData {
    let mut out = mesh.clone();
    for _ in 0..levels {
        out = subdivide_once(&out);
    }
    out
}

fn subdivide_once(mesh: &MeshData) -> MeshData {
    let mut positions = mesh.positions.clone();
    let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
    let mut faces = Vec::with_capacity(mesh.faces.len() * 4);

    let mut midpoint = |positions: &mut Vec<[f32; 3]>, a: u32, b: u32| -> u32 {
        let key = (a.min(b), a.max(b));
        *midpoints.entry(key).or_insert_with(|| {
            let p = (Vec3::from(positions[a as usize]) + Vec3::from(positions[b as usize])) * 0.5;
            positions.push(p.to_array());
            positions.len() as u32 - 1
        })
    };

    for face in &mesh.faces {
        let n = face.vertices.len();
        let centroid = face
            .vertices
            .iter()
            .map(|&v| Vec3::from(mesh.positions[v as usize]))
            .sum::<Vec3>()
            / n as f32;
        positions.push(centroid.to_array());
        let center = positions.len() as u32 - 1;

        let edge_mid: Vec<u32> = (0..n)
            .map(|i| midpoint(&mut positions, face.vertices[i], face.vertices[(i + 1) % n]))
            .collect();

        let uv_centers: Vec<[f32; 2]> = face
            .uvs
            .iter()
            .map(|layer| (layer.iter().map(|&uv| Vec2::from(uv)).sum::<Vec2>() / n as f32).to_array())
            .collect();

        for i in 0..n {
            let prev = (i + n - 1) % n;
            let next = (i + 1) % n;
            faces.push(Face {
                vertices: vec![face.vertices[i], edge_mid[i], center, edge_mid[prev]],
                material_index: face.material_index,
                uvs: face
                    .uvs
                    .iter()
                    .zip(&uv_centers)
                    .map(|(layer, &uv_center)| {
                        let here = Vec2::from(layer[i]);
                        vec![
                            layer[i],
                            ((here + Vec2::from(layer[next])) * 0.5).to_array(),
                            uv_center,
                            ((here + Vec2::from(layer[prev])) * 0.5).to_array(),
                        ]
                    })
                    .collect(),
            });
        }
    }

    MeshData {
        name: mesh.name.clone(),
        positions,
        faces,
        uv_layers: mesh.uv_layers.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubdivisionOptions;
    use crate::scene::Object;

    fn scene() -> Scene {
        let mut scene = Scene::new("Test");
        scene.add_object(
            Object::mesh("Smooth", "SmoothMesh")
                .with_modifier(Modifier::subdivision("Subdivision", 4, 5))
                .with_modifier(Modifier::Other {
                    name: "Bevel".to_string(),
                }),
        );
        scene.add_object(Object::mesh("Low", "LowMesh").with_modifier(Modifier::subdivision("Subdivision", 1, 2)));
        scene
    }

    #[test]
    fn test_override_and_restore() {
        let mut scene = scene();
        let before = scene.clone();
        let sources = vec![ObjectRef::from("Smooth"), ObjectRef::from("Low")];

        let records = apply_override(&mut scene, &sources, &SubdivisionOptions::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_levels, 4);
        assert_eq!(records[0].original_render_levels, 5);
        assert_eq!(viewport_levels(&scene.object("Smooth").unwrap().modifiers), 2);
        assert_eq!(scene.object("Low").unwrap().modifiers, before.object("Low").unwrap().modifiers);

        assert_eq!(restore(&mut scene, &records), 1);
        assert_eq!(scene, before);
    }

    #[test]
    fn test_excluded_and_override_levels() {
        let mut scene = scene();
        let mut options = SubdivisionOptions::default();
        options.excluded.push("Smooth".to_string());
        options.overrides.insert("Low".to_string(), 0);
        let sources = vec![ObjectRef::from("Smooth"), ObjectRef::from("Low")];

        let records = apply_override(&mut scene, &sources, &options);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object.as_str(), "Low");
        assert_eq!(viewport_levels(&scene.object("Low").unwrap().modifiers), 0);
    }

    #[test]
    fn test_subdivide_cube() {
        let cube = MeshData::cube("Cube", 1.0);
        let once = subdivide(&cube, 1);
        assert_eq!(once.face_count(), 24);
        // 8 corners + 12 edge midpoints + 6 face centres
        assert_eq!(once.vertex_count(), 26);
        assert!(once.validate().is_ok());
        assert_eq!(subdivide(&cube, 2).face_count(), 96);
        assert_eq!(subdivide(&cube, 0), cube);
    }

    #[test]
    fn test_subdivide_keeps_uvs() {
        let mut tri = MeshData::with_geometry(
            "Tri",
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![Face::new(vec![0, 1, 2])],
        );
        tri.uv_layers.push("UVMap".to_string());
        tri.faces[0].uvs = vec![vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]];
        let out = subdivide(&tri, 1);
        assert_eq!(out.face_count(), 3);
        assert!(out.validate().is_ok());
        assert_eq!(out.faces[0].uvs[0][1], [0.5, 0.0]);
    }
}
