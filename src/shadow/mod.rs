//! Working copies ("shadow data") and proxy entities.
//!
//! Before any stage runs, every mesh-bearing source entity gets a deep copy
//! of its mesh bound in place of the original. Stages only ever touch those
//! copies. Entities outside the view layer (reachable only through an
//! instancing empty) additionally get a hidden proxy object sharing the copy,
//! so stages that need a processable object have one.
//!
//! [`revert`] rebinds the originals. Deleting the copies and proxies is left
//! to [`crate::reclaim`].

use crate::pipeline::report::PipelineReport;
use crate::scene::{Object, Scene};
use crate::types::ObjectRef;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Name prefix of working mesh data blocks.
pub const WORKING_PREFIX: &str = "SHADOW_";

/// Name prefix of proxy objects.
pub const PROXY_PREFIX: &str = "PROXY_";

/// Everything needed to undo one swap.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapRecord {
    /// The source entity.
    pub object: ObjectRef,
    /// Mesh data bound to the source before the run.
    pub original_mesh: String,
    /// Material slots of the source before the run.
    pub original_materials: Vec<Option<String>>,
    /// The working copy.
    pub working_mesh: String,
    /// Proxy hosting the working copy, when the source is not in the view layer.
    pub proxy: Option<ObjectRef>,
}

impl SwapRecord {
    /// The entity stages should operate on.
    pub fn target(&self) -> &ObjectRef {
        self.proxy.as_ref().unwrap_or(&self.object)
    }
}

/// Swap a working copy onto every mesh-bearing source.
///
/// Non-mesh sources are passed over. A source whose mesh is missing or fails
/// validation is dropped with a warning; the rest continue.
pub fn materialize(scene: &mut Scene, sources: &[ObjectRef], report: &mut PipelineReport) -> Vec<SwapRecord> {
    let mut records = Vec::new();
    let mut seen = BTreeSet::new();

    for source in sources {
        if !seen.insert(source.clone()) {
            continue;
        }
        let Some(object) = scene.object(source.as_str()) else {
            report.warn(format!("{}: no longer exists, skipped", source));
            continue;
        };
        if !object.is_mesh() {
            continue;
        }

        match materialize_one(scene, source) {
            Ok(record) => records.push(record),
            Err(reason) => report.warn(format!("{}: {}, skipped", source, reason)),
        }
    }

    debug!(
        swapped = records.len(),
        proxies = records.iter().filter(|r| r.proxy.is_some()).count(),
        "Materialized working copies"
    );
    records
}

fn materialize_one(scene: &mut Scene, source: &ObjectRef) -> Result<SwapRecord, String> {
    let object = scene
        .object(source.as_str())
        .ok_or_else(|| "object missing".to_string())?;
    let original_mesh = object
        .data
        .clone()
        .ok_or_else(|| "object has no mesh data".to_string())?;
    let original_materials = object.materials.clone();
    let transform = object.transform;

    let mesh = scene
        .mesh(&original_mesh)
        .ok_or_else(|| format!("mesh '{}' missing", original_mesh))?;
    mesh.validate().map_err(|e| e.to_string())?;

    let mut copy = mesh.clone();
    copy.name = format!("{}{}", WORKING_PREFIX, source);
    let working_mesh = scene.add_mesh(copy);

    if let Some(object) = scene.object_mut(source.as_str()) {
        object.data = Some(working_mesh.clone());
    }

    let proxy = if scene.is_in_view_layer(source.as_str()) {
        None
    } else {
        let mut proxy = Object::mesh(format!("{}{}", PROXY_PREFIX, source), working_mesh.as_str())
            .with_transform(transform);
        proxy.materials = original_materials.clone();
        proxy.hidden = true;
        proxy.selectable = false;
        Some(scene.add_object(proxy))
    };

    Ok(SwapRecord {
        object: source.clone(),
        original_mesh,
        original_materials,
        working_mesh,
        proxy,
    })
}

/// Copy a proxy's material slots onto its source, which shares the working mesh.
///
/// Stages that remap face material indices on a proxy call this so the
/// source's slots keep matching the mesh it exports.
pub fn sync_proxy_slots(scene: &mut Scene, record: &SwapRecord) {
    let Some(proxy) = &record.proxy else {
        return;
    };
    let Some(slots) = scene.object(proxy.as_str()).map(|p| p.materials.clone()) else {
        return;
    };
    if let Some(object) = scene.object_mut(record.object.as_str()) {
        object.materials = slots;
    }
}

/// Rebind original mesh data and material slots by name.
///
/// Deletes nothing. Returns the number of entities restored.
pub fn revert(scene: &mut Scene, records: &[SwapRecord]) -> usize {
    let mut restored = 0;
    for record in records {
        if !scene.meshes.contains_key(&record.original_mesh) {
            warn!(object = %record.object, mesh = %record.original_mesh, "Original mesh vanished during run");
            continue;
        }
        match scene.object_mut(record.object.as_str()) {
            Some(object) => {
                object.data = Some(record.original_mesh.clone());
                object.materials = record.original_materials.clone();
                restored += 1;
                debug!(object = %record.object, mesh = %record.original_mesh, "Rebound original mesh");
            }
            None => {
                warn!(object = %record.object, "Source object vanished during run");
            }
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Face, MeshData};

    fn scene_with_instanced_source() -> Scene {
        let mut scene = Scene::new("Test");
        let cube = scene.add_mesh(MeshData::cube("CubeMesh", 1.0));
        scene.add_object(Object::mesh("Cube", cube.as_str()).with_materials(&["Red"]));

        let rock = scene.add_mesh(MeshData::cube("RockMesh", 0.5));
        scene.add_object_unlinked(Object::mesh("Rock", rock.as_str()));
        scene.add_collection("Rocks", &["Rock"]);
        scene.add_object(Object::instancer("RockInstance", "Rocks"));
        scene
    }

    #[test]
    fn test_materialize_direct_and_proxy() {
        let mut scene = scene_with_instanced_source();
        let mut report = PipelineReport::new();
        let sources = vec![ObjectRef::from("Cube"), ObjectRef::from("Rock"), ObjectRef::from("RockInstance")];

        let records = materialize(&mut scene, &sources, &mut report);
        assert_eq!(records.len(), 2);

        let cube = &records[0];
        assert!(cube.proxy.is_none());
        assert_eq!(cube.target().as_str(), "Cube");
        assert_eq!(scene.object("Cube").unwrap().data.as_deref(), Some("SHADOW_Cube"));

        let rock = &records[1];
        let proxy = rock.proxy.as_ref().unwrap();
        assert_eq!(proxy.as_str(), "PROXY_Rock");
        let proxy_obj = scene.object(proxy.as_str()).unwrap();
        assert!(proxy_obj.hidden && !proxy_obj.selectable);
        assert_eq!(scene.mesh_users(&rock.working_mesh), 2);
    }

    #[test]
    fn test_revert_restores_bindings() {
        let mut scene = scene_with_instanced_source();
        let mut report = PipelineReport::new();
        let records = materialize(&mut scene, &[ObjectRef::from("Cube")], &mut report);

        scene.object_mut("Cube").unwrap().materials.clear();
        scene.mesh_mut("SHADOW_Cube").unwrap().faces.truncate(1);

        assert_eq!(revert(&mut scene, &records), 1);
        let cube = scene.object("Cube").unwrap();
        assert_eq!(cube.data.as_deref(), Some("CubeMesh"));
        assert_eq!(cube.materials, vec![Some("Red".to_string())]);
        assert_eq!(scene.mesh("CubeMesh").unwrap().face_count(), 6);
        assert_eq!(scene.mesh_users("SHADOW_Cube"), 0);
    }

    #[test]
    fn test_corrupt_source_is_dropped_with_warning() {
        let mut scene = scene_with_instanced_source();
        let bad = scene.add_mesh(MeshData::with_geometry("Bad", vec![[0.0; 3]], vec![Face::new(vec![0, 1, 2])]));
        scene.add_object(Object::mesh("Broken", bad.as_str()));
        let mut report = PipelineReport::new();

        let records = materialize(
            &mut scene,
            &[ObjectRef::from("Broken"), ObjectRef::from("Cube")],
            &mut report,
        );
        assert_eq!(records.len(), 1);
        assert!(report.has_warning_containing("Broken"));
        assert_eq!(scene.object("Broken").unwrap().data.as_deref(), Some("Bad"));
    }

    #[test]
    fn test_duplicate_sources_get_one_copy() {
        let mut scene = scene_with_instanced_source();
        let mut report = PipelineReport::new();
        let records = materialize(
            &mut scene,
            &[ObjectRef::from("Cube"), ObjectRef::from("Cube")],
            &mut report,
        );
        assert_eq!(records.len(), 1);
        assert!(!scene.meshes.contains_key("SHADOW_Cube.001"));
    }
}
