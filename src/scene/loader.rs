//! Scene loading from ZIP files and directories.
//!
//! A scene bundle holds a `scene.json` description plus the image files it
//! references by relative path.

use super::{load_image_from_bytes, Collection, Material, MeshData, Object, Scene};
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Name of the description file inside a bundle.
pub const SCENE_FILE: &str = "scene.json";

/// Serialized form of a scene.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDescription {
    #[serde(default = "default_scene_name")]
    pub name: String,
    #[serde(default)]
    pub objects: Vec<Object>,
    #[serde(default)]
    pub meshes: Vec<MeshData>,
    #[serde(default)]
    pub materials: Vec<Material>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub collections: Vec<Collection>,
    /// Objects in the view layer; every object when absent.
    #[serde(default)]
    pub view_layer: Option<Vec<String>>,
    #[serde(default)]
    pub selection: Vec<String>,
}

fn default_scene_name() -> String {
    "Scene".to_string()
}

/// An image referenced by relative path within the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    pub name: String,
    pub path: String,
}

/// Load a scene from a file path.
///
/// Supports both ZIP files and directories.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Scene> {
    let path = path.as_ref();

    let mut scene = if path.is_dir() {
        load_from_directory(path)?
    } else {
        let data = std::fs::read(path)?;
        load_from_bytes(&data)?
    };
    scene.source_path = Some(path.to_path_buf());
    Ok(scene)
}

/// Load a scene from bytes (ZIP data).
pub fn load_from_bytes(data: &[u8]) -> Result<Scene> {
    let cursor = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(cursor)?;

    let mut description = None;
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().trim_start_matches("./").to_string();

        if name == SCENE_FILE || name.ends_with(&format!("/{}", SCENE_FILE)) {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            description = Some(serde_json::from_str::<SceneDescription>(&contents)?);
        } else {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            files.insert(name, bytes);
        }
    }

    let description = description
        .ok_or_else(|| BridgeError::InvalidScene(format!("archive has no {}", SCENE_FILE)))?;

    build_scene(description, |path| files.get(path).cloned())
}

/// Load a scene from a directory.
fn load_from_directory(path: &Path) -> Result<Scene> {
    let contents = std::fs::read_to_string(path.join(SCENE_FILE))?;
    let description: SceneDescription = serde_json::from_str(&contents)?;
    build_scene(description, |relative| std::fs::read(path.join(relative)).ok())
}

/// Build a scene from a description, reading images through `read`.
pub fn build_scene<F>(description: SceneDescription, read: F) -> Result<Scene>
where
    F: Fn(&str) -> Option<Vec<u8>>,
{
    let mut scene = Scene::new(description.name);

    for mesh in description.meshes {
        if scene.meshes.contains_key(&mesh.name) {
            return Err(BridgeError::InvalidScene(format!("duplicate mesh '{}'", mesh.name)));
        }
        scene.meshes.insert(mesh.name.clone(), mesh);
    }

    for material in description.materials {
        scene.materials.insert(material.name.clone(), material);
    }

    for entry in description.images {
        let Some(bytes) = read(&entry.path) else {
            warn!(image = %entry.name, path = %entry.path, "Image file missing, skipping");
            continue;
        };
        match load_image_from_bytes(&entry.name, &bytes) {
            Ok(image) => {
                scene.images.insert(entry.name.clone(), image);
            }
            Err(e) => {
                warn!(image = %entry.name, error = %e, "Failed to decode image, skipping");
            }
        }
    }

    for collection in description.collections {
        scene.collections.insert(collection.name.clone(), collection);
    }

    for object in description.objects {
        if scene.objects.contains_key(&object.name) {
            return Err(BridgeError::InvalidScene(format!("duplicate object '{}'", object.name)));
        }
        if let Some(data) = &object.data {
            if !scene.meshes.contains_key(data) {
                return Err(BridgeError::InvalidScene(format!(
                    "object '{}' references missing mesh '{}'",
                    object.name, data
                )));
            }
        }
        scene.objects.insert(object.name.clone(), object);
    }

    scene.view_layer = match description.view_layer {
        Some(names) => names
            .into_iter()
            .filter(|n| scene.objects.contains_key(n))
            .collect(),
        None => scene.objects.keys().cloned().collect(),
    };

    let selection: Vec<&str> = description.selection.iter().map(String::as_str).collect();
    scene.select(&selection);

    debug!(
        objects = scene.objects.len(),
        meshes = scene.meshes.len(),
        images = scene.images.len(),
        "Loaded scene"
    );

    Ok(scene)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Face;
    use std::io::Write;

    fn description() -> SceneDescription {
        SceneDescription {
            name: "Room".to_string(),
            objects: vec![Object::mesh("Floor", "FloorMesh").with_materials(&["Wood"])],
            meshes: vec![MeshData::with_geometry(
                "FloorMesh",
                vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0, 1.0]],
                vec![Face::new(vec![0, 1, 2])],
            )],
            materials: vec![Material::principled("Wood", Some("wood"))],
            images: vec![
                ImageEntry {
                    name: "wood".to_string(),
                    path: "textures/wood.png".to_string(),
                },
                ImageEntry {
                    name: "broken".to_string(),
                    path: "textures/broken.png".to_string(),
                },
            ],
            collections: Vec::new(),
            view_layer: None,
            selection: vec!["Floor".to_string()],
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([120, 80, 40, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("textures")).unwrap();
        std::fs::write(dir.path().join("textures/wood.png"), png_bytes()).unwrap();
        std::fs::write(dir.path().join("textures/broken.png"), b"not a png").unwrap();
        std::fs::write(
            dir.path().join(SCENE_FILE),
            serde_json::to_string(&description()).unwrap(),
        )
        .unwrap();

        let scene = load_from_path(dir.path()).unwrap();
        assert_eq!(scene.name, "Room");
        assert!(scene.image("wood").is_some());
        assert!(scene.image("broken").is_none());
        assert_eq!(scene.selection.len(), 1);
        assert!(scene.is_in_view_layer("Floor"));
        assert_eq!(scene.source_path.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_load_from_zip() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file(SCENE_FILE, options).unwrap();
            writer
                .write_all(serde_json::to_string(&description()).unwrap().as_bytes())
                .unwrap();
            writer.start_file("textures/wood.png", options).unwrap();
            writer.write_all(&png_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let scene = load_from_bytes(buffer.get_ref()).unwrap();
        assert_eq!(scene.objects.len(), 1);
        assert_eq!(scene.mesh_users("FloorMesh"), 1);
        assert!(scene.image("wood").unwrap().packed.is_some());
    }

    #[test]
    fn test_missing_mesh_is_invalid() {
        let mut desc = description();
        desc.meshes.clear();
        let result = build_scene(desc, |_| None);
        assert!(matches!(result, Err(BridgeError::InvalidScene(_))));
    }
}
