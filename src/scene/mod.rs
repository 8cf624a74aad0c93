//! In-memory scene graph the export pipeline runs against.
//!
//! Every store is keyed by name. Handles into the scene are never held
//! across a mutation; callers keep names (see [`ObjectRef`]) and resolve
//! them again when they need the data.

mod image;
pub mod loader;
mod material;
mod mesh;

pub use image::{load_image_from_bytes, scaled_dimensions, ImageData, PackedSource};
pub use loader::{load_from_bytes, load_from_path};
pub use material::{Material, NodeLink, ShaderNode, IMAGE_TEXTURE_KIND, OUTPUT_KIND, OUTPUT_NODE};
pub use mesh::{Face, MeshData};

use crate::error::{BridgeError, Result};
use crate::types::{ObjectRef, Transform};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// What kind of entity an object is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectKind {
    Mesh,
    /// An empty, optionally instancing a collection.
    Empty {
        #[serde(default)]
        instance_collection: Option<String>,
    },
    /// Cameras, lights and anything else the exporter ignores.
    Other,
}

/// An object modifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Modifier {
    Subdivision {
        name: String,
        levels: u32,
        render_levels: u32,
    },
    Other {
        name: String,
    },
}

impl Modifier {
    pub fn subdivision(name: impl Into<String>, levels: u32, render_levels: u32) -> Self {
        Modifier::Subdivision {
            name: name.into(),
            levels,
            render_levels,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Modifier::Subdivision { name, .. } | Modifier::Other { name } => name,
        }
    }
}

/// A scene object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    pub kind: ObjectKind,
    /// Name of the mesh data block, for mesh objects.
    #[serde(default)]
    pub data: Option<String>,
    /// Material slots; faces index into this list.
    #[serde(default)]
    pub materials: Vec<Option<String>>,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_true")]
    pub selectable: bool,
}

fn default_true() -> bool {
    true
}

impl Object {
    pub fn mesh(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Mesh,
            data: Some(data.into()),
            materials: Vec::new(),
            modifiers: Vec::new(),
            transform: Transform::IDENTITY,
            hidden: false,
            selectable: true,
        }
    }

    pub fn instancer(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Empty {
                instance_collection: Some(collection.into()),
            },
            data: None,
            materials: Vec::new(),
            modifiers: Vec::new(),
            transform: Transform::IDENTITY,
            hidden: false,
            selectable: true,
        }
    }

    pub fn with_materials(mut self, materials: &[&str]) -> Self {
        self.materials = materials.iter().map(|m| Some(m.to_string())).collect();
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn is_mesh(&self) -> bool {
        self.kind == ObjectKind::Mesh && self.data.is_some()
    }

    pub fn instance_collection(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::Empty {
                instance_collection,
            } => instance_collection.as_deref(),
            _ => None,
        }
    }

    /// Material names in slot order, skipping empty slots.
    pub fn material_names(&self) -> impl Iterator<Item = &str> {
        self.materials.iter().filter_map(|m| m.as_deref())
    }
}

/// A named group of objects, the target of instancing empties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub objects: Vec<String>,
}

/// The scene: name-keyed stores plus view-layer and selection state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scene {
    pub name: String,
    /// File the scene was loaded from; the payload filename derives from it.
    pub source_path: Option<PathBuf>,
    pub objects: BTreeMap<String, Object>,
    pub meshes: BTreeMap<String, MeshData>,
    pub materials: BTreeMap<String, Material>,
    pub images: BTreeMap<String, ImageData>,
    pub collections: BTreeMap<String, Collection>,
    /// Objects in the active view layer; only these can be selected.
    pub view_layer: BTreeSet<String>,
    pub selection: BTreeSet<String>,
    pub active: Option<String>,
}

/// `base`, or `base.001`, `base.002`... whichever is free first.
fn unique_name<V>(store: &BTreeMap<String, V>, base: &str) -> String {
    if !store.contains_key(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{}.{:03}", base, i))
        .find(|candidate| !store.contains_key(candidate))
        .unwrap_or_else(|| base.to_string())
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn unique_object_name(&self, base: &str) -> String {
        unique_name(&self.objects, base)
    }

    pub fn unique_mesh_name(&self, base: &str) -> String {
        unique_name(&self.meshes, base)
    }

    pub fn unique_image_name(&self, base: &str) -> String {
        unique_name(&self.images, base)
    }

    /// Insert an object into the view layer, renaming it if the name is taken.
    pub fn add_object(&mut self, object: Object) -> ObjectRef {
        let name = self.add_object_unlinked(object);
        self.view_layer.insert(name.as_str().to_string());
        name
    }

    /// Insert an object outside the view layer (e.g. only reachable by instancing).
    pub fn add_object_unlinked(&mut self, mut object: Object) -> ObjectRef {
        let name = self.unique_object_name(&object.name);
        object.name = name.clone();
        self.objects.insert(name.clone(), object);
        ObjectRef::new(name)
    }

    /// Insert a mesh data block, returning its (possibly suffixed) name.
    pub fn add_mesh(&mut self, mut mesh: MeshData) -> String {
        let name = self.unique_mesh_name(&mesh.name);
        mesh.name = name.clone();
        self.meshes.insert(name.clone(), mesh);
        name
    }

    pub fn add_material(&mut self, material: Material) -> String {
        let name = unique_name(&self.materials, &material.name);
        self.materials.insert(
            name.clone(),
            Material {
                name: name.clone(),
                ..material
            },
        );
        name
    }

    pub fn add_image(&mut self, mut image: ImageData) -> String {
        let name = self.unique_image_name(&image.name);
        image.name = name.clone();
        self.images.insert(name.clone(), image);
        name
    }

    pub fn add_collection(&mut self, name: impl Into<String>, objects: &[&str]) -> String {
        let name = unique_name(&self.collections, &name.into());
        self.collections.insert(
            name.clone(),
            Collection {
                name: name.clone(),
                objects: objects.iter().map(|o| o.to_string()).collect(),
            },
        );
        name
    }

    pub fn object(&self, name: &str) -> Option<&Object> {
        self.objects.get(name)
    }

    pub fn object_mut(&mut self, name: &str) -> Option<&mut Object> {
        self.objects.get_mut(name)
    }

    pub fn require_object(&self, name: &str) -> Result<&Object> {
        self.objects
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(format!("object '{}'", name)))
    }

    pub fn mesh(&self, name: &str) -> Option<&MeshData> {
        self.meshes.get(name)
    }

    pub fn mesh_mut(&mut self, name: &str) -> Option<&mut MeshData> {
        self.meshes.get_mut(name)
    }

    /// Mesh data currently bound to a mesh object.
    pub fn object_mesh(&self, object: &str) -> Option<&MeshData> {
        let data = self.objects.get(object)?.data.as_deref()?;
        self.meshes.get(data)
    }

    pub fn object_mesh_mut(&mut self, object: &str) -> Option<&mut MeshData> {
        let data = self.objects.get(object)?.data.clone()?;
        self.meshes.get_mut(&data)
    }

    pub fn material(&self, name: &str) -> Option<&Material> {
        self.materials.get(name)
    }

    pub fn image(&self, name: &str) -> Option<&ImageData> {
        self.images.get(name)
    }

    /// Number of objects whose data names this mesh.
    pub fn mesh_users(&self, mesh: &str) -> usize {
        self.objects
            .values()
            .filter(|o| o.data.as_deref() == Some(mesh))
            .count()
    }

    pub fn is_in_view_layer(&self, object: &str) -> bool {
        self.view_layer.contains(object)
    }

    /// Remove an object and every selection/view-layer reference to it.
    pub fn remove_object(&mut self, name: &str) -> Result<Object> {
        let object = self
            .objects
            .remove(name)
            .ok_or_else(|| BridgeError::NotFound(format!("object '{}'", name)))?;
        self.view_layer.remove(name);
        self.selection.remove(name);
        if self.active.as_deref() == Some(name) {
            self.active = None;
        }
        Ok(object)
    }

    /// Remove a mesh data block; fails while any object still uses it.
    pub fn remove_mesh(&mut self, name: &str) -> Result<MeshData> {
        if !self.meshes.contains_key(name) {
            return Err(BridgeError::NotFound(format!("mesh '{}'", name)));
        }
        let users = self.mesh_users(name);
        if users > 0 {
            return Err(BridgeError::MeshInUse {
                name: name.to_string(),
                users,
            });
        }
        self.meshes
            .remove(name)
            .ok_or_else(|| BridgeError::NotFound(format!("mesh '{}'", name)))
    }

    pub fn remove_image(&mut self, name: &str) -> Result<ImageData> {
        self.images
            .remove(name)
            .ok_or_else(|| BridgeError::NotFound(format!("image '{}'", name)))
    }

    /// Replace the selection. Names outside the view layer are ignored.
    pub fn select(&mut self, names: &[&str]) {
        self.selection = names
            .iter()
            .filter(|n| self.view_layer.contains(**n))
            .map(|n| n.to_string())
            .collect();
        self.active = names
            .iter()
            .find(|n| self.selection.contains(**n))
            .map(|n| n.to_string());
    }

    pub fn selected(&self) -> Vec<ObjectRef> {
        self.selection.iter().map(|n| ObjectRef::new(n.as_str())).collect()
    }

    /// Objects of an instanced collection, in collection order.
    pub fn collection_objects(&self, collection: &str) -> impl Iterator<Item = &Object> {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(|c| c.objects.iter())
            .filter_map(|name| self.objects.get(name))
    }
}
