//! GLB (binary glTF 2.0) writer.
//!
//! Every exported entity becomes a node carrying its transform. Mesh
//! entities get one primitive per used material slot with smooth normals
//! and the first UV layer; instancing empties get the instanced
//! collection's members as child nodes. Scene coordinates are Z-up and are
//! converted to glTF's Y-up on the way out.

use super::{AssetWriter, ExportSet, ImageMode, Quantization, SerializeSettings};
use crate::error::{BridgeError, Result};
use crate::scene::{ImageData, MeshData, Object, Scene};
use crate::shadow::WORKING_PREFIX;
use crate::stages::subdivision::{subdivide, viewport_levels};
use crate::types::{BoundingBox, Transform};
use gltf_json as json;
use image::{DynamicImage, ImageFormat};
use json::validation::Checked::Valid;
use json::validation::USize64;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use tracing::{debug, warn};

/// Largest side a WebP image can have.
pub const WEBP_MAX_DIMENSION: u32 = 16383;

const WEBP_EXTENSION: &str = "EXT_texture_webp";
const QUANTIZATION_EXTENSION: &str = "KHR_mesh_quantization";

/// Collections nested deeper than this are not followed.
const MAX_INSTANCE_DEPTH: usize = 8;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const CHUNK_JSON: u32 = 0x4E4F534A;
const CHUNK_BIN: u32 = 0x004E4942;

/// Writes GLB with `gltf-json`.
#[derive(Debug, Default)]
pub struct GlbWriter;

impl AssetWriter for GlbWriter {
    fn write(&self, scene: &Scene, set: &ExportSet, settings: &SerializeSettings) -> Result<Vec<u8>> {
        if set.is_empty() {
            return Err(BridgeError::Export("Cannot export an empty selection".to_string()));
        }

        let mut builder = GlbBuilder::new(scene, settings);
        let mut roots = Vec::new();
        for name in &set.objects {
            let object = scene.require_object(name.as_str())?;
            if let Some(node) = builder.object_node(object, 0)? {
                roots.push(node);
            }
        }
        if roots.is_empty() {
            return Err(BridgeError::Export("Nothing in the selection has geometry".to_string()));
        }

        builder.finish(roots)
    }
}

/// Geometry of one primitive before encoding.
#[derive(Debug, Clone, PartialEq)]
struct PrimitiveData {
    slot: usize,
    positions: Vec<[f32; 3]>,
    normals: Vec<[f32; 3]>,
    uvs: Option<Vec<[f32; 2]>>,
    indices: Vec<u32>,
}

impl PrimitiveData {
    fn new(slot: usize, has_uvs: bool) -> Self {
        Self {
            slot,
            positions: Vec::new(),
            normals: Vec::new(),
            uvs: has_uvs.then(Vec::new),
            indices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MeshEntry {
    index: u32,
    /// Translation and scale undoing position quantization.
    dequantize: Option<([f32; 3], [f32; 3])>,
}

type MeshKey = (String, Vec<Option<String>>, u32);

struct GlbBuilder<'a> {
    scene: &'a Scene,
    settings: &'a SerializeSettings,
    buffer: Vec<u8>,
    root: json::Root,
    node_names: Vec<String>,
    mesh_names: Vec<String>,
    material_names: Vec<String>,
    meshes: HashMap<MeshKey, Option<MeshEntry>>,
    materials: HashMap<String, Option<u32>>,
    textures: HashMap<String, u32>,
    webp_textures: Vec<u32>,
}

fn y_up(p: [f32; 3]) -> [f32; 3] {
    [p[0], p[2], -p[1]]
}

impl<'a> GlbBuilder<'a> {
    fn new(scene: &'a Scene, settings: &'a SerializeSettings) -> Self {
        Self {
            scene,
            settings,
            buffer: Vec::new(),
            root: json::Root::default(),
            node_names: Vec::new(),
            mesh_names: Vec::new(),
            material_names: Vec::new(),
            meshes: HashMap::new(),
            materials: HashMap::new(),
            textures: HashMap::new(),
            webp_textures: Vec::new(),
        }
    }

    fn object_node(&mut self, object: &Object, depth: usize) -> Result<Option<u32>> {
        let scene = self.scene;
        let mut mesh = None;
        let mut children = Vec::new();

        if object.is_mesh() {
            match self.mesh_for(object)? {
                Some(MeshEntry {
                    index,
                    dequantize: None,
                }) => mesh = Some(index),
                Some(MeshEntry {
                    index,
                    dequantize: Some((offset, step)),
                }) => {
                    let frame = Transform {
                        translation: offset,
                        rotation: [0.0, 0.0, 0.0, 1.0],
                        scale: step,
                    };
                    children.push(self.push_node(format!("{}_geometry", object.name), &frame, Some(index), Vec::new(), false));
                }
                None => {}
            }
        }

        if let Some(collection) = object.instance_collection() {
            if depth < MAX_INSTANCE_DEPTH {
                for member in scene.collection_objects(collection) {
                    if let Some(child) = self.object_node(member, depth + 1)? {
                        children.push(child);
                    }
                }
            } else {
                warn!(object = %object.name, collection, "Instancing nested too deep, skipped");
            }
        }

        if mesh.is_none() && children.is_empty() {
            debug!(object = %object.name, "Nothing to write for object");
            return Ok(None);
        }
        Ok(Some(self.push_node(object.name.clone(), &object.transform, mesh, children, true)))
    }

    fn push_node(
        &mut self,
        name: String,
        transform: &Transform,
        mesh: Option<u32>,
        children: Vec<u32>,
        convert: bool,
    ) -> u32 {
        let (translation, rotation, scale) = if convert {
            let [x, y, z, w] = transform.rotation;
            let [sx, sy, sz] = transform.scale;
            (y_up(transform.translation), [x, z, -y, w], [sx, sz, sy])
        } else {
            (transform.translation, transform.rotation, transform.scale)
        };

        let index = self.root.nodes.len() as u32;
        self.root.nodes.push(json::Node {
            camera: None,
            children: (!children.is_empty()).then(|| children.into_iter().map(json::Index::new).collect()),
            extensions: Default::default(),
            extras: Default::default(),
            matrix: None,
            mesh: mesh.map(json::Index::new),
            rotation: (rotation != [0.0, 0.0, 0.0, 1.0]).then_some(json::scene::UnitQuaternion(rotation)),
            scale: (scale != [1.0; 3]).then_some(scale),
            translation: (translation != [0.0; 3]).then_some(translation),
            skin: None,
            weights: None,
        });
        self.node_names.push(name);
        index
    }

    fn mesh_for(&mut self, object: &Object) -> Result<Option<MeshEntry>> {
        let scene = self.scene;
        let data = scene
            .object_mesh(&object.name)
            .ok_or_else(|| BridgeError::NotFound(format!("mesh data of '{}'", object.name)))?;
        let levels = viewport_levels(&object.modifiers);
        let key = (data.name.clone(), object.materials.clone(), levels);
        if let Some(entry) = self.meshes.get(&key) {
            return Ok(*entry);
        }

        data.validate()?;
        let mesh: Cow<MeshData> = if levels > 0 {
            Cow::Owned(subdivide(data, levels))
        } else {
            Cow::Borrowed(data)
        };

        let mut primitives = split_primitives(&mesh);
        if primitives.is_empty() {
            self.meshes.insert(key, None);
            return Ok(None);
        }

        let quantization = self.settings.quantization;
        if let Some(q) = quantization {
            for primitive in &mut primitives {
                if q.level >= 5 {
                    sort_triangles(primitive);
                }
                if q.level >= 1 {
                    reorder_vertices(primitive);
                }
            }
        }

        let dequantize = quantization.map(|q| position_frame(&primitives, q.position_bits));

        let mut json_primitives = Vec::with_capacity(primitives.len());
        for primitive in &primitives {
            let material = match object.materials.get(primitive.slot).cloned().flatten() {
                Some(name) => self.material_index(&name)?,
                None => None,
            };
            json_primitives.push(self.write_primitive(primitive, material, quantization, dequantize));
        }

        let index = self.root.meshes.len() as u32;
        self.root.meshes.push(json::Mesh {
            extensions: Default::default(),
            extras: Default::default(),
            primitives: json_primitives,
            weights: None,
        });
        let name = data.name.strip_prefix(WORKING_PREFIX).unwrap_or(&data.name);
        self.mesh_names.push(name.to_string());

        let entry = MeshEntry { index, dequantize };
        self.meshes.insert(key, Some(entry));
        Ok(Some(entry))
    }

    fn push_view(&mut self, bytes: &[u8], target: Option<json::buffer::Target>, stride: Option<usize>) -> u32 {
        align4(&mut self.buffer);
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        let index = self.root.buffer_views.len() as u32;
        self.root.buffer_views.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: USize64(bytes.len() as u64),
            byte_offset: Some(USize64(offset as u64)),
            byte_stride: stride.map(json::buffer::Stride),
            extensions: Default::default(),
            extras: Default::default(),
            target: target.map(Valid),
        });
        index
    }

    #[allow(clippy::too_many_arguments)]
    fn push_accessor(
        &mut self,
        view: u32,
        count: usize,
        type_: json::accessor::Type,
        component_type: json::accessor::ComponentType,
        normalized: bool,
        min: Option<Value>,
        max: Option<Value>,
    ) -> u32 {
        let index = self.root.accessors.len() as u32;
        self.root.accessors.push(json::Accessor {
            buffer_view: Some(json::Index::new(view)),
            byte_offset: Some(USize64(0)),
            count: USize64(count as u64),
            component_type: Valid(json::accessor::GenericComponentType(component_type)),
            extensions: Default::default(),
            extras: Default::default(),
            type_: Valid(type_),
            min,
            max,
            normalized,
            sparse: None,
        });
        index
    }

    fn write_primitive(
        &mut self,
        primitive: &PrimitiveData,
        material: Option<u32>,
        quantization: Option<Quantization>,
        dequantize: Option<([f32; 3], [f32; 3])>,
    ) -> json::mesh::Primitive {
        use json::accessor::{ComponentType, Type};

        let count = primitive.positions.len();
        let mut attributes = BTreeMap::new();

        // Positions
        let position = match (quantization, dequantize) {
            (Some(q), Some((offset, step))) => {
                let max_q = ((1u32 << q.position_bits) - 1) as f32;
                let mut bytes = Vec::with_capacity(count * 8);
                let mut lo = [u16::MAX; 3];
                let mut hi = [0u16; 3];
                for p in &primitive.positions {
                    for i in 0..3 {
                        let v = ((p[i] - offset[i]) / step[i]).round().clamp(0.0, max_q) as u16;
                        lo[i] = lo[i].min(v);
                        hi[i] = hi[i].max(v);
                        bytes.extend_from_slice(&v.to_le_bytes());
                    }
                    bytes.extend_from_slice(&[0, 0]);
                }
                let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), Some(8));
                let min = Value::from(lo.iter().map(|v| *v as f64).collect::<Vec<_>>());
                let max = Value::from(hi.iter().map(|v| *v as f64).collect::<Vec<_>>());
                self.push_accessor(view, count, Type::Vec3, ComponentType::U16, false, Some(min), Some(max))
            }
            _ => {
                let bounds = BoundingBox::from_points(primitive.positions.iter().copied())
                    .unwrap_or(BoundingBox::new([0.0; 3], [0.0; 3]));
                let bytes = f32_bytes(primitive.positions.iter().flatten());
                let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), None);
                self.push_accessor(
                    view,
                    count,
                    Type::Vec3,
                    ComponentType::F32,
                    false,
                    Some(Value::from(bounds.min.to_vec())),
                    Some(Value::from(bounds.max.to_vec())),
                )
            }
        };
        attributes.insert(Valid(json::mesh::Semantic::Positions), json::Index::new(position));

        // Normals
        let normal = match quantization {
            Some(q) if q.normal_bits <= 8 => {
                let mut bytes = Vec::with_capacity(count * 4);
                for n in &primitive.normals {
                    for v in n {
                        bytes.push(quantize_snorm(*v, q.normal_bits, i8::MAX as f32) as i8 as u8);
                    }
                    bytes.push(0);
                }
                let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), Some(4));
                self.push_accessor(view, count, Type::Vec3, ComponentType::I8, true, None, None)
            }
            Some(q) => {
                let mut bytes = Vec::with_capacity(count * 8);
                for n in &primitive.normals {
                    for v in n {
                        let s = quantize_snorm(*v, q.normal_bits, i16::MAX as f32) as i16;
                        bytes.extend_from_slice(&s.to_le_bytes());
                    }
                    bytes.extend_from_slice(&[0, 0]);
                }
                let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), Some(8));
                self.push_accessor(view, count, Type::Vec3, ComponentType::I16, true, None, None)
            }
            None => {
                let bytes = f32_bytes(primitive.normals.iter().flatten());
                let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), None);
                self.push_accessor(view, count, Type::Vec3, ComponentType::F32, false, None, None)
            }
        };
        attributes.insert(Valid(json::mesh::Semantic::Normals), json::Index::new(normal));

        // Texture coordinates
        if let Some(uvs) = &primitive.uvs {
            let in_unit = uvs.iter().flatten().all(|v| (0.0..=1.0).contains(v));
            let texcoord = match quantization {
                Some(q) if in_unit => {
                    let levels = ((1u32 << q.texcoord_bits) - 1) as f32;
                    let mut bytes = Vec::with_capacity(count * 4);
                    for v in uvs.iter().flatten() {
                        let stored = ((*v * levels).round() / levels * u16::MAX as f32).round() as u16;
                        bytes.extend_from_slice(&stored.to_le_bytes());
                    }
                    let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), None);
                    self.push_accessor(view, count, Type::Vec2, ComponentType::U16, true, None, None)
                }
                _ => {
                    let bytes = f32_bytes(uvs.iter().flatten());
                    let view = self.push_view(&bytes, Some(json::buffer::Target::ArrayBuffer), None);
                    self.push_accessor(view, count, Type::Vec2, ComponentType::F32, false, None, None)
                }
            };
            attributes.insert(Valid(json::mesh::Semantic::TexCoords(0)), json::Index::new(texcoord));
        }

        // Indices
        let indices = if quantization.is_some() && count <= u16::MAX as usize {
            let bytes: Vec<u8> = primitive
                .indices
                .iter()
                .flat_map(|i| (*i as u16).to_le_bytes())
                .collect();
            let view = self.push_view(&bytes, Some(json::buffer::Target::ElementArrayBuffer), None);
            self.push_accessor(view, primitive.indices.len(), Type::Scalar, ComponentType::U16, false, None, None)
        } else {
            let bytes: Vec<u8> = primitive.indices.iter().flat_map(|i| i.to_le_bytes()).collect();
            let view = self.push_view(&bytes, Some(json::buffer::Target::ElementArrayBuffer), None);
            self.push_accessor(view, primitive.indices.len(), Type::Scalar, ComponentType::U32, false, None, None)
        };

        json::mesh::Primitive {
            attributes,
            extensions: Default::default(),
            extras: Default::default(),
            indices: Some(json::Index::new(indices)),
            material: material.map(json::Index::new),
            mode: Valid(json::mesh::Mode::Triangles),
            targets: None,
        }
    }

    fn material_index(&mut self, name: &str) -> Result<Option<u32>> {
        if let Some(index) = self.materials.get(name) {
            return Ok(*index);
        }
        let scene = self.scene;
        let Some(material) = scene.material(name) else {
            warn!(material = name, "Material slot names a missing material");
            self.materials.insert(name.to_string(), None);
            return Ok(None);
        };

        let image = material
            .use_nodes
            .then(|| material.images().find_map(|i| scene.image(i)))
            .flatten();
        let texture = match image {
            Some(image) => Some(self.texture_index(image)?),
            None => None,
        };
        let blended = material.base_color[3] < 1.0 || image.is_some_and(ImageData::has_transparency);

        let index = self.root.materials.len() as u32;
        self.root.materials.push(json::Material {
            pbr_metallic_roughness: json::material::PbrMetallicRoughness {
                base_color_texture: texture.map(|t| json::texture::Info {
                    index: json::Index::new(t),
                    tex_coord: 0,
                    extensions: Default::default(),
                    extras: Default::default(),
                }),
                base_color_factor: json::material::PbrBaseColorFactor(material.base_color),
                metallic_factor: json::material::StrengthFactor(0.0),
                roughness_factor: json::material::StrengthFactor(0.5),
                metallic_roughness_texture: None,
                extensions: Default::default(),
                extras: Default::default(),
            },
            alpha_mode: Valid(if blended {
                json::material::AlphaMode::Blend
            } else {
                json::material::AlphaMode::Opaque
            }),
            alpha_cutoff: None,
            double_sided: false,
            normal_texture: None,
            occlusion_texture: None,
            emissive_texture: None,
            emissive_factor: json::material::EmissiveFactor([0.0, 0.0, 0.0]),
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.material_names.push(name.to_string());
        self.materials.insert(name.to_string(), Some(index));
        Ok(Some(index))
    }

    fn texture_index(&mut self, image: &ImageData) -> Result<u32> {
        if let Some(index) = self.textures.get(&image.name) {
            return Ok(*index);
        }

        let (bytes, mime_type) = encode_image(image, self.settings.image_mode)?;
        let view = self.push_view(&bytes, None, None);

        let image_index = self.root.images.len() as u32;
        self.root.images.push(json::Image {
            buffer_view: Some(json::Index::new(view)),
            mime_type: Some(json::image::MimeType(mime_type.clone())),
            uri: None,
            extensions: Default::default(),
            extras: Default::default(),
        });

        if self.root.samplers.is_empty() {
            self.root.samplers.push(json::texture::Sampler {
                mag_filter: Some(Valid(json::texture::MagFilter::Linear)),
                min_filter: Some(Valid(json::texture::MinFilter::LinearMipmapLinear)),
                wrap_s: Valid(json::texture::WrappingMode::Repeat),
                wrap_t: Valid(json::texture::WrappingMode::Repeat),
                extensions: Default::default(),
                extras: Default::default(),
            });
        }

        let index = self.root.textures.len() as u32;
        self.root.textures.push(json::Texture {
            sampler: Some(json::Index::new(0)),
            source: json::Index::new(image_index),
            extensions: Default::default(),
            extras: Default::default(),
        });
        if mime_type == "image/webp" {
            self.webp_textures.push(index);
        }
        self.textures.insert(image.name.clone(), index);
        Ok(index)
    }

    fn finish(mut self, roots: Vec<u32>) -> Result<Vec<u8>> {
        align4(&mut self.buffer);
        self.root.buffers.push(json::Buffer {
            byte_length: USize64(self.buffer.len() as u64),
            extensions: Default::default(),
            extras: Default::default(),
            uri: None,
        });
        self.root.scenes.push(json::Scene {
            extensions: Default::default(),
            extras: Default::default(),
            nodes: roots.into_iter().map(json::Index::new).collect(),
        });
        self.root.scene = Some(json::Index::new(0));

        let mut value = serde_json::to_value(&self.root)?;
        self.annotate(&mut value);
        let json_bytes = serde_json::to_vec(&value)?;

        debug!(
            nodes = self.root.nodes.len(),
            meshes = self.root.meshes.len(),
            images = self.root.images.len(),
            bin_bytes = self.buffer.len(),
            "Assembled GLB"
        );
        Ok(assemble_glb(&json_bytes, &self.buffer))
    }

    /// Names, generator and extensions, written straight into the JSON.
    fn annotate(&self, value: &mut Value) {
        fn name_all(value: &mut Value, key: &str, names: &[String]) {
            if let Some(items) = value.get_mut(key).and_then(Value::as_array_mut) {
                for (item, name) in items.iter_mut().zip(names) {
                    item["name"] = Value::from(name.as_str());
                }
            }
        }
        name_all(value, "nodes", &self.node_names);
        name_all(value, "meshes", &self.mesh_names);
        name_all(value, "materials", &self.material_names);

        value["asset"]["generator"] = Value::from(format!("glb-bridge {}", env!("CARGO_PKG_VERSION")));

        let mut extensions = Vec::new();
        if self.settings.quantization.is_some() && !self.root.meshes.is_empty() {
            extensions.push(QUANTIZATION_EXTENSION);
        }
        if !self.webp_textures.is_empty() {
            extensions.push(WEBP_EXTENSION);
            if let Some(textures) = value.get_mut("textures").and_then(Value::as_array_mut) {
                for index in &self.webp_textures {
                    if let Some(texture) = textures.get_mut(*index as usize).and_then(Value::as_object_mut) {
                        if let Some(source) = texture.remove("source") {
                            texture.insert(
                                "extensions".to_string(),
                                serde_json::json!({ WEBP_EXTENSION: { "source": source } }),
                            );
                        }
                    }
                }
            }
        }
        if !extensions.is_empty() {
            value["extensionsUsed"] = Value::from(extensions.clone());
            value["extensionsRequired"] = Value::from(extensions);
        }
    }
}

/// Split a mesh into per-slot triangle lists with unique (position, uv) vertices.
fn split_primitives(mesh: &MeshData) -> Vec<PrimitiveData> {
    let normals = mesh.vertex_normals();
    let has_uvs = mesh.has_uvs();
    let mut by_slot: BTreeMap<usize, (PrimitiveData, HashMap<(u32, [u32; 2]), u32>)> = BTreeMap::new();

    for face in &mesh.faces {
        let slot = face.material_index as usize;
        let (primitive, lookup) = by_slot
            .entry(slot)
            .or_insert_with(|| (PrimitiveData::new(slot, has_uvs), HashMap::new()));

        let corners: Vec<u32> = face
            .vertices
            .iter()
            .enumerate()
            .map(|(corner, &v)| {
                let uv = if has_uvs { face.uvs[0][corner] } else { [0.0, 0.0] };
                let key = (v, [uv[0].to_bits(), uv[1].to_bits()]);
                *lookup.entry(key).or_insert_with(|| {
                    primitive.positions.push(y_up(mesh.positions[v as usize]));
                    primitive.normals.push(y_up(normals[v as usize]));
                    if let Some(uvs) = primitive.uvs.as_mut() {
                        // glTF puts the UV origin top-left.
                        uvs.push([uv[0], 1.0 - uv[1]]);
                    }
                    primitive.positions.len() as u32 - 1
                })
            })
            .collect();

        for i in 1..corners.len().saturating_sub(1) {
            primitive.indices.extend([corners[0], corners[i], corners[i + 1]]);
        }
    }

    by_slot
        .into_values()
        .map(|(primitive, _)| primitive)
        .filter(|p| !p.indices.is_empty())
        .collect()
}

/// Sort triangles by their lowest vertex index so neighbours stay close in the index stream.
fn sort_triangles(primitive: &mut PrimitiveData) {
    let mut triangles: Vec<[u32; 3]> = primitive
        .indices
        .chunks_exact(3)
        .map(|t| [t[0], t[1], t[2]])
        .collect();
    triangles.sort_by_key(|t| t[0].min(t[1]).min(t[2]));
    primitive.indices = triangles.concat();
}

/// Renumber vertices in order of first use.
fn reorder_vertices(primitive: &mut PrimitiveData) {
    let mut remap = vec![u32::MAX; primitive.positions.len()];
    let mut order = Vec::with_capacity(primitive.positions.len());
    for index in primitive.indices.iter_mut() {
        let old = *index as usize;
        if remap[old] == u32::MAX {
            remap[old] = order.len() as u32;
            order.push(old);
        }
        *index = remap[old];
    }

    primitive.positions = order.iter().map(|&o| primitive.positions[o]).collect();
    primitive.normals = order.iter().map(|&o| primitive.normals[o]).collect();
    if let Some(uvs) = primitive.uvs.as_mut() {
        *uvs = order.iter().map(|&o| uvs[o]).collect();
    }
}

/// Offset and step of the quantization grid covering every primitive.
fn position_frame(primitives: &[PrimitiveData], bits: u8) -> ([f32; 3], [f32; 3]) {
    let bounds = BoundingBox::from_points(primitives.iter().flat_map(|p| p.positions.iter().copied()))
        .unwrap_or(BoundingBox::new([0.0; 3], [0.0; 3]));
    let steps = ((1u32 << bits) - 1) as f32;
    let extent = bounds.dimensions();
    let step = extent.map(|e| if e > 0.0 { e / steps } else { 1.0 });
    (bounds.min, step)
}

fn quantize_snorm(value: f32, bits: u8, storage_max: f32) -> f32 {
    let levels = ((1u32 << (bits - 1)) - 1) as f32;
    let q = (value.clamp(-1.0, 1.0) * levels).round() / levels;
    (q * storage_max).round()
}

fn f32_bytes<'v>(values: impl Iterator<Item = &'v f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

fn align4(buffer: &mut Vec<u8>) {
    let padding = (4 - (buffer.len() % 4)) % 4;
    buffer.extend(std::iter::repeat(0u8).take(padding));
}

/// Encode an image for embedding, returning the bytes and their MIME type.
pub(crate) fn encode_image(image: &ImageData, mode: ImageMode) -> Result<(Vec<u8>, String)> {
    if mode == ImageMode::None {
        if let Some(packed) = &image.packed {
            return Ok((packed.bytes.clone(), packed.mime_type.clone()));
        }
    }
    if mode == ImageMode::Webp && image.max_dimension() > WEBP_MAX_DIMENSION {
        return Err(BridgeError::Export(format!(
            "Image '{}' is {}x{}, larger than the WebP limit of {} px",
            image.name, image.width, image.height, WEBP_MAX_DIMENSION
        )));
    }

    let rgba = image.to_rgba_image().ok_or_else(|| {
        BridgeError::Export(format!(
            "Image '{}' has {} bytes of pixel data for {}x{}",
            image.name,
            image.pixels.len(),
            image.width,
            image.height
        ))
    })?;

    let (format, mime_type) = match mode {
        ImageMode::Webp => (ImageFormat::WebP, "image/webp"),
        ImageMode::Auto if !image.has_transparency() => (ImageFormat::Jpeg, "image/jpeg"),
        ImageMode::Auto | ImageMode::None => (ImageFormat::Png, "image/png"),
    };

    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgba8(rgba).to_rgb8().write_to(&mut cursor, format)?;
    } else {
        rgba.write_to(&mut cursor, format)?;
    }
    Ok((bytes, mime_type.to_string()))
}

/// Wrap a JSON chunk and a binary chunk into a GLB container.
fn assemble_glb(json_bytes: &[u8], buffer: &[u8]) -> Vec<u8> {
    // Pad JSON to 4-byte alignment
    let json_padding = (4 - (json_bytes.len() % 4)) % 4;
    let padded_json_len = json_bytes.len() + json_padding;

    // Pad buffer to 4-byte alignment
    let buffer_padding = (4 - (buffer.len() % 4)) % 4;
    let padded_buffer_len = buffer.len() + buffer_padding;

    let total_size = 12 + // GLB header
        8 + padded_json_len + // JSON chunk
        8 + padded_buffer_len; // BIN chunk

    let mut glb = Vec::with_capacity(total_size);

    // GLB Header
    glb.extend_from_slice(GLB_MAGIC);
    glb.extend_from_slice(&2u32.to_le_bytes()); // version
    glb.extend_from_slice(&(total_size as u32).to_le_bytes()); // length

    // JSON Chunk
    glb.extend_from_slice(&(padded_json_len as u32).to_le_bytes());
    glb.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    glb.extend_from_slice(json_bytes);
    glb.extend(std::iter::repeat(0x20u8).take(json_padding)); // padding (spaces)

    // BIN Chunk
    glb.extend_from_slice(&(padded_buffer_len as u32).to_le_bytes());
    glb.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    glb.extend_from_slice(buffer);
    glb.extend(std::iter::repeat(0u8).take(buffer_padding)); // padding (zeros)

    glb
}

/// Parse the JSON chunk of a GLB payload.
pub fn read_glb_json(glb: &[u8]) -> Result<Value> {
    let invalid = |reason: &str| BridgeError::Export(format!("Not a GLB payload: {}", reason));
    if glb.len() < 20 || &glb[0..4] != GLB_MAGIC {
        return Err(invalid("missing glTF header"));
    }
    let word = |at: usize| u32::from_le_bytes([glb[at], glb[at + 1], glb[at + 2], glb[at + 3]]);
    if word(12) != CHUNK_JSON {
        return Err(invalid("first chunk is not JSON"));
    }
    let length = word(8) as usize;
    let json_bytes = glb.get(20..20 + length).ok_or_else(|| invalid("truncated JSON chunk"))?;
    Ok(serde_json::from_slice(json_bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Material, Modifier, PackedSource};
    use crate::types::ObjectRef;

    fn cube_scene() -> Scene {
        let mut scene = Scene::new("Test");
        scene.add_image(ImageData::solid("crate.png", 8, 8, [120, 80, 40, 255]));
        scene.add_material(Material::principled("Crate", Some("crate.png")));
        scene.add_material(Material::principled("Trim", None));
        let mut cube = MeshData::cube("CubeMesh", 1.0);
        cube.faces[0].material_index = 1;
        let mesh = scene.add_mesh(cube);
        scene.add_object(Object::mesh("Cube", mesh.as_str()).with_materials(&["Crate", "Trim"]));
        scene
    }

    fn export(scene: &Scene, names: &[&str], settings: &SerializeSettings) -> Result<Value> {
        let set = ExportSet::new(names.iter().map(|n| ObjectRef::from(*n)).collect());
        let glb = GlbWriter.write(scene, &set, settings)?;
        assert_eq!(&glb[0..4], b"glTF");
        assert_eq!(u32::from_le_bytes([glb[4], glb[5], glb[6], glb[7]]), 2); // version
        assert_eq!(glb.len() % 4, 0);
        read_glb_json(&glb)
    }

    #[test]
    fn test_export_cube_per_material_primitives() {
        let scene = cube_scene();
        let gltf = export(&scene, &["Cube"], &SerializeSettings::default()).unwrap();

        assert_eq!(gltf["nodes"][0]["name"], "Cube");
        assert_eq!(gltf["meshes"][0]["name"], "CubeMesh");
        let primitives = gltf["meshes"][0]["primitives"].as_array().unwrap();
        assert_eq!(primitives.len(), 2);
        assert_eq!(gltf["materials"].as_array().unwrap().len(), 2);
        assert_eq!(gltf["extensionsRequired"][0], "EXT_texture_webp");
        assert!(gltf["textures"][0].get("source").is_none());
        assert_eq!(gltf["textures"][0]["extensions"]["EXT_texture_webp"]["source"], 0);
        assert_eq!(gltf["images"][0]["mimeType"], "image/webp");
    }

    #[test]
    fn test_empty_set_is_rejected() {
        let scene = cube_scene();
        assert!(export(&scene, &[], &SerializeSettings::default()).is_err());
        assert!(matches!(
            export(&scene, &["Nope"], &SerializeSettings::default()),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_instancer_exports_collection_members() {
        let mut scene = cube_scene();
        let cube = scene.remove_object("Cube").unwrap();
        scene.add_object_unlinked(cube);
        scene.add_collection("Props", &["Cube"]);
        scene.add_object(
            Object::instancer("PropSet", "Props").with_transform(Transform::from_translation([0.0, 0.0, 2.0])),
        );

        let gltf = export(&scene, &["PropSet"], &SerializeSettings::default()).unwrap();
        let scene_nodes = gltf["scenes"][0]["nodes"].as_array().unwrap();
        assert_eq!(scene_nodes.len(), 1);
        let root = &gltf["nodes"][scene_nodes[0].as_u64().unwrap() as usize];
        assert_eq!(root["name"], "PropSet");
        // Z-up translation becomes Y-up.
        assert_eq!(root["translation"], serde_json::json!([0.0, 2.0, -0.0]));
        assert_eq!(root["children"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_image_modes() {
        let mut image = ImageData::solid("opaque", 4, 4, [1, 2, 3, 255]);
        assert_eq!(encode_image(&image, ImageMode::Auto).unwrap().1, "image/jpeg");
        image.pixels[3] = 10;
        assert_eq!(encode_image(&image, ImageMode::Auto).unwrap().1, "image/png");
        assert_eq!(encode_image(&image, ImageMode::None).unwrap().1, "image/png");

        image.packed = Some(PackedSource {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
        });
        assert_eq!(encode_image(&image, ImageMode::None).unwrap().0, vec![1, 2, 3]);

        let wide = ImageData::solid("wide", WEBP_MAX_DIMENSION + 1, 1, [0, 0, 0, 255]);
        assert!(encode_image(&wide, ImageMode::Webp).is_err());
        assert!(encode_image(&wide, ImageMode::Auto).is_ok());
    }

    #[test]
    fn test_quantized_export() {
        let scene = cube_scene();
        let settings = SerializeSettings {
            image_mode: ImageMode::Auto,
            quantization: Some(Quantization {
                level: 6,
                position_bits: 14,
                normal_bits: 10,
                texcoord_bits: 12,
            }),
        };
        let gltf = export(&scene, &["Cube"], &settings).unwrap();

        assert_eq!(gltf["extensionsRequired"], serde_json::json!(["KHR_mesh_quantization"]));
        let cube = &gltf["nodes"][1];
        assert_eq!(cube["name"], "Cube");
        let geometry = &gltf["nodes"][cube["children"][0].as_u64().unwrap() as usize];
        assert_eq!(geometry["name"], "Cube_geometry");
        assert!(geometry["scale"].is_array());

        let primitive = &gltf["meshes"][0]["primitives"][0];
        let position = &gltf["accessors"][primitive["attributes"]["POSITION"].as_u64().unwrap() as usize];
        assert_eq!(position["componentType"], 5123);
        let normal = &gltf["accessors"][primitive["attributes"]["NORMAL"].as_u64().unwrap() as usize];
        assert_eq!(normal["componentType"], 5122);
        assert_eq!(normal["normalized"], true);
    }

    #[test]
    fn test_subdivision_is_applied() {
        let mut scene = cube_scene();
        scene
            .object_mut("Cube")
            .unwrap()
            .modifiers
            .push(Modifier::subdivision("Subdivision", 1, 3));
        let gltf = export(&scene, &["Cube"], &SerializeSettings::default()).unwrap();
        let index_total: u64 = gltf["meshes"][0]["primitives"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| gltf["accessors"][p["indices"].as_u64().unwrap() as usize]["count"].as_u64().unwrap())
            .sum();
        // 24 quads after one level, two triangles each.
        assert_eq!(index_total, 24 * 2 * 3);
    }

    #[test]
    fn test_reorder_vertices_by_first_use() {
        let mut primitive = PrimitiveData::new(0, false);
        primitive.positions = vec![[0.0; 3], [1.0; 3], [2.0; 3]];
        primitive.normals = vec![[0.0, 0.0, 1.0]; 3];
        primitive.indices = vec![2, 0, 1];
        reorder_vertices(&mut primitive);
        assert_eq!(primitive.indices, vec![0, 1, 2]);
        assert_eq!(primitive.positions[0], [2.0; 3]);
    }

    #[test]
    fn test_read_glb_json_rejects_garbage() {
        assert!(read_glb_json(b"not a glb at all, really").is_err());
    }
}
