//! Material readiness analysis for glTF export.
//!
//! The shading graph is walked from `Material Output` through links in
//! both directions and every reachable node kind is checked against the
//! lists below. Findings are split into blocking issues and warnings; the
//! pipeline only reports them.

use crate::scene::{Material, Scene, IMAGE_TEXTURE_KIND, OUTPUT_KIND, OUTPUT_NODE};
use crate::types::ObjectRef;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

const SUPPORTED_SHADERS: &[&str] = &["BSDF_PRINCIPLED", "EMISSION"];

const SUPPORTED_OTHER: &[&str] = &[
    // Textures and coordinates
    "TEX_IMAGE",
    "UVMAP",
    "MAPPING",
    "NORMAL_MAP",
    // Utilities
    "MATH",
    "MIX",
    "VALTORGB",
    "SEPRGB",
    "SEPARATE_COLOR",
    "COMBRGB",
    "COMBINE_COLOR",
    "VECT_MATH",
    "ATTRIBUTE",
    // Inputs
    "RGB",
    "VALUE",
    "GEOMETRY",
    "TEX_COORD",
];

const UNSUPPORTED_SHADERS: &[&str] = &[
    "BSDF_DIFFUSE",
    "BSDF_GLOSSY",
    "BSDF_ANISOTROPIC",
    "BSDF_GLASS",
    "BSDF_TRANSLUCENT",
    "BSDF_VELVET",
    "BSDF_TOON",
    "BSDF_HAIR",
    "VOLUME_SHADER",
    "SUBSURFACE_SCATTERING",
    "BSDF_REFRACTION",
];

const PROCEDURAL_TEXTURES: &[&str] = &[
    "TEX_NOISE",
    "TEX_VORONOI",
    "TEX_WAVE",
    "TEX_MAGIC",
    "TEX_CHECKER",
    "TEX_BRICK",
    "TEX_GRADIENT",
    "TEX_MUSGRAVE",
    "TEX_WHITE_NOISE",
];

const UNSUPPORTED_UTILITIES: &[&str] = &[
    "LIGHT_PATH",
    "OBJECT_INFO",
    "PARTICLE_INFO",
    "FRESNEL",
    "LAYER_WEIGHT",
    "CURVE_RGB",
    "CURVE_VEC",
    "BLACKBODY",
    "WAVELENGTH",
];

const GROUP_KIND: &str = "GROUP";
const MIX_SHADER_KIND: &str = "MIX_SHADER";

/// Node count above which a graph is flagged as complex.
const COMPLEX_TREE_NODES: usize = 20;

/// Result of analyzing one material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialReadiness {
    pub is_ready: bool,
    /// Blocking problems, as heading lines followed by `  • item` lines.
    pub issues: Vec<String>,
    /// Non-blocking notes.
    pub warnings: Vec<String>,
}

impl MaterialReadiness {
    fn ready() -> Self {
        Self {
            is_ready: true,
            issues: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn blocked(heading: &str, item: &str) -> Self {
        Self {
            is_ready: false,
            issues: vec![heading.to_string(), format!("  • {}", item)],
            warnings: Vec::new(),
        }
    }

    fn push_block(&mut self, heading: &str, items: &[String]) {
        if items.is_empty() {
            return;
        }
        self.is_ready = false;
        self.issues.push(heading.to_string());
        self.issues.extend(items.iter().map(|i| format!("  • {}", i)));
    }
}

/// Analyzes materials for export readiness.
pub trait MaterialValidator {
    fn analyze(&self, material: &Material) -> MaterialReadiness;
}

/// Allow-list/deny-list validator over the shading graph.
#[derive(Debug, Default)]
pub struct NodeGraphValidator;

fn is_supported(kind: &str) -> bool {
    SUPPORTED_SHADERS.contains(&kind) || SUPPORTED_OTHER.contains(&kind)
}

/// Display label for a node in issue lists.
fn label(name: &str, kind: &str) -> String {
    if kind == GROUP_KIND {
        format!("{} (Group Node)", name)
    } else {
        format!("{} ({})", name, kind)
    }
}

/// Whether an image name carries a UDIM tile number such as `_1001.`.
pub fn is_udim_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes
        .windows(6)
        .any(|w| w[0] == b'_' && w[1..5].iter().all(u8::is_ascii_digit) && w[5] == b'.')
}

/// Names of nodes reachable from the output node, in visit order.
fn reachable_nodes(material: &Material) -> Vec<&str> {
    let Some(output) = material.node(OUTPUT_NODE) else {
        return Vec::new();
    };
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![output.name.as_str()];
    while let Some(name) = stack.pop() {
        if !visited.insert(name) {
            continue;
        }
        order.push(name);
        for link in material.links_of(name) {
            let next = if link.to_node == name { &link.from_node } else { &link.to_node };
            if material.node(next).is_some() && !visited.contains(next.as_str()) {
                stack.push(next);
            }
        }
    }
    order
}

impl MaterialValidator for NodeGraphValidator {
    fn analyze(&self, material: &Material) -> MaterialReadiness {
        if !material.use_nodes {
            return MaterialReadiness::blocked("Material issues:", "Material does not use nodes");
        }
        if material.node(OUTPUT_NODE).is_none() {
            return MaterialReadiness::blocked("Material Output issues:", "Missing Material Output node");
        }
        let Some(surface_link) = material.inputs_to(OUTPUT_NODE, "Surface").next() else {
            return MaterialReadiness::blocked(
                "Material Output issues:",
                "Material Output Surface input not connected",
            );
        };

        let mut result = MaterialReadiness::ready();
        let surface = surface_link.from_node.as_str();

        let mut unsupported_shaders = Vec::new();
        if let Some(node) = material.node(surface) {
            if !SUPPORTED_SHADERS.contains(&node.kind.as_str()) {
                result.is_ready = false;
                unsupported_shaders.push(label(&node.name, &node.kind));
            }
        }

        if material.inputs_to(OUTPUT_NODE, "Volume").next().is_some() {
            result
                .warnings
                .push("Volume shader connected (limited glTF support)".to_string());
        }

        let nodes = reachable_nodes(material);
        let mut procedural = Vec::new();
        let mut utilities = Vec::new();
        let mut udim = Vec::new();
        let mut complex_mix = Vec::new();

        for name in &nodes {
            let Some(node) = material.node(name) else {
                continue;
            };
            let kind = node.kind.as_str();
            if kind == OUTPUT_KIND || node.name == surface {
                continue;
            }

            if UNSUPPORTED_SHADERS.contains(&kind) || kind == GROUP_KIND || !is_supported(kind) {
                // Procedural textures and utilities have their own blocks.
                if !PROCEDURAL_TEXTURES.contains(&kind) && !UNSUPPORTED_UTILITIES.contains(&kind) {
                    unsupported_shaders.push(label(&node.name, kind));
                }
            }
            if PROCEDURAL_TEXTURES.contains(&kind) {
                procedural.push(label(&node.name, kind));
            }
            if UNSUPPORTED_UTILITIES.contains(&kind) {
                utilities.push(label(&node.name, kind));
            }
            if kind == IMAGE_TEXTURE_KIND && node.image.as_deref().is_some_and(is_udim_name) {
                udim.push(node.name.clone());
            }
            if kind == MIX_SHADER_KIND {
                let principled = material
                    .links
                    .iter()
                    .filter(|l| l.to_node == node.name)
                    .filter(|l| material.node(&l.from_node).is_some_and(|n| n.kind == "BSDF_PRINCIPLED"))
                    .count();
                if principled > 1 {
                    complex_mix.push(node.name.clone());
                }
            }
        }

        if !unsupported_shaders.is_empty() {
            result.push_block("Unsupported shader nodes:", &unsupported_shaders);
            result
                .issues
                .push("  Use Principled BSDF or Emission shader instead".to_string());
        }
        result.push_block("Contains procedural textures:", &procedural);
        result.push_block("Contains unsupported utility nodes:", &utilities);
        result.push_block("Complex Mix Shader setup mixing multiple Principled BSDFs:", &complex_mix);

        if !udim.is_empty() {
            result.warnings.push(format!(
                "UDIM textures detected: {} (will split into multiple images)",
                udim.join(", ")
            ));
        }
        if nodes.len() > COMPLEX_TREE_NODES {
            result.warnings.push(format!(
                "Complex node tree ({} nodes) - may export with reduced fidelity",
                nodes.len()
            ));
        }

        result
    }
}

/// Materials used by `objects`, following instancing empties into their collections.
pub fn gather_materials(scene: &Scene, objects: &[ObjectRef]) -> BTreeSet<String> {
    fn visit(scene: &Scene, name: &str, seen: &mut HashSet<String>, out: &mut BTreeSet<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(object) = scene.object(name) else {
            return;
        };
        if object.is_mesh() {
            out.extend(object.material_names().map(str::to_string));
        }
        if let Some(collection) = object.instance_collection() {
            let members: Vec<String> = scene
                .collection_objects(collection)
                .map(|o| o.name.clone())
                .collect();
            for member in members {
                visit(scene, &member, seen, out);
            }
        }
    }

    let mut seen = HashSet::new();
    let mut out = BTreeSet::new();
    for object in objects {
        visit(scene, object.as_str(), &mut seen, &mut out);
    }
    out.retain(|m| scene.material(m).is_some());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MeshData, NodeLink, Object, ShaderNode};

    fn analyze(material: &Material) -> MaterialReadiness {
        NodeGraphValidator.analyze(material)
    }

    #[test]
    fn test_principled_is_ready() {
        let result = analyze(&Material::principled("Wood", Some("wood.png")));
        assert!(result.is_ready);
        assert!(result.issues.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_early_returns() {
        let mut no_nodes = Material::principled("Flat", None);
        no_nodes.use_nodes = false;
        assert_eq!(
            analyze(&no_nodes).issues,
            vec!["Material issues:", "  • Material does not use nodes"]
        );

        let empty = Material::new("Empty");
        assert_eq!(analyze(&empty).issues[1], "  • Missing Material Output node");

        let mut unlinked = Material::principled("Loose", None);
        unlinked.links.clear();
        let result = analyze(&unlinked);
        assert!(!result.is_ready);
        assert_eq!(result.issues[1], "  • Material Output Surface input not connected");
    }

    #[test]
    fn test_unsupported_surface_and_group() {
        let mut mat = Material::new("Glassy");
        mat.nodes.push(ShaderNode::new(OUTPUT_NODE, OUTPUT_KIND));
        mat.nodes.push(ShaderNode::new("Glass BSDF", "BSDF_GLASS"));
        mat.nodes.push(ShaderNode::new("Custom", "GROUP"));
        mat.links.push(NodeLink::new("Glass BSDF", OUTPUT_NODE, "Surface"));
        mat.links.push(NodeLink::new("Custom", "Glass BSDF", "Color"));

        let result = analyze(&mat);
        assert!(!result.is_ready);
        assert_eq!(
            result.issues,
            vec![
                "Unsupported shader nodes:",
                "  • Glass BSDF (BSDF_GLASS)",
                "  • Custom (Group Node)",
                "  Use Principled BSDF or Emission shader instead",
            ]
        );
    }

    #[test]
    fn test_procedural_and_utility_nodes() {
        let mut mat = Material::principled("Rock", None);
        mat.nodes.push(ShaderNode::new("Noise Texture", "TEX_NOISE"));
        mat.nodes.push(ShaderNode::new("Fresnel", "FRESNEL"));
        mat.links.push(NodeLink::new("Noise Texture", "Principled BSDF", "Base Color"));
        mat.links.push(NodeLink::new("Fresnel", "Principled BSDF", "Specular"));
        // Unreachable nodes are ignored.
        mat.nodes.push(ShaderNode::new("Stray Wave", "TEX_WAVE"));

        let result = analyze(&mat);
        assert!(!result.is_ready);
        assert!(result.issues.contains(&"Contains procedural textures:".to_string()));
        assert!(result.issues.contains(&"  • Noise Texture (TEX_NOISE)".to_string()));
        assert!(result.issues.contains(&"Contains unsupported utility nodes:".to_string()));
        assert!(!result.issues.iter().any(|i| i.contains("Stray Wave")));
        assert!(!result.issues.contains(&"Unsupported shader nodes:".to_string()));
    }

    #[test]
    fn test_complex_mix_shader() {
        let mut mat = Material::new("Blend");
        mat.nodes.push(ShaderNode::new(OUTPUT_NODE, OUTPUT_KIND));
        mat.nodes.push(ShaderNode::new("Emission", "EMISSION"));
        mat.nodes.push(ShaderNode::new("Mix Shader", MIX_SHADER_KIND));
        mat.nodes.push(ShaderNode::new("A", "BSDF_PRINCIPLED"));
        mat.nodes.push(ShaderNode::new("B", "BSDF_PRINCIPLED"));
        mat.links.push(NodeLink::new("Emission", OUTPUT_NODE, "Surface"));
        mat.links.push(NodeLink::new("Mix Shader", "Emission", "Color"));
        mat.links.push(NodeLink::new("A", "Mix Shader", "Shader"));
        mat.links.push(NodeLink::new("B", "Mix Shader", "Shader_001"));

        let result = analyze(&mat);
        assert!(!result.is_ready);
        assert!(result
            .issues
            .contains(&"Complex Mix Shader setup mixing multiple Principled BSDFs:".to_string()));
        assert!(result.issues.contains(&"  • Mix Shader (MIX_SHADER)".to_string()));
    }

    #[test]
    fn test_warnings() {
        let mut mat = Material::principled("Tiles", Some("tiles_1001.png"));
        mat.nodes.push(ShaderNode::new("Volume", "VOLUME_ABSORPTION"));
        mat.links.push(NodeLink::new("Volume", OUTPUT_NODE, "Volume"));
        for i in 0..20 {
            let name = format!("Value {}", i);
            mat.nodes.push(ShaderNode::new(name.as_str(), "VALUE"));
            mat.links.push(NodeLink::new(name.as_str(), "Principled BSDF", "Roughness"));
        }

        let result = analyze(&mat);
        assert!(result
            .warnings
            .contains(&"Volume shader connected (limited glTF support)".to_string()));
        assert!(result
            .warnings
            .contains(&"UDIM textures detected: Image Texture (will split into multiple images)".to_string()));
        assert!(result.warnings.iter().any(|w| w.starts_with("Complex node tree (24 nodes)")));
    }

    #[test]
    fn test_udim_names() {
        assert!(is_udim_name("skin_1001.png"));
        assert!(!is_udim_name("skin_101.png"));
        assert!(!is_udim_name("skin1001.png"));
    }

    #[test]
    fn test_gather_through_instancer() {
        let mut scene = Scene::new("Test");
        scene.add_material(Material::principled("Leaf", None));
        scene.add_material(Material::principled("Bark", None));
        let mesh = scene.add_mesh(MeshData::cube("TreeMesh", 1.0));
        scene.add_object_unlinked(Object::mesh("Tree", mesh.as_str()).with_materials(&["Leaf", "Bark", "Missing"]));
        scene.add_collection("Trees", &["Tree"]);
        scene.add_object(Object::instancer("Forest", "Trees"));

        let materials = gather_materials(&scene, &[ObjectRef::from("Forest")]);
        assert_eq!(materials.into_iter().collect::<Vec<_>>(), vec!["Bark", "Leaf"]);
    }
}
