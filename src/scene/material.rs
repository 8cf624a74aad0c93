//! Materials and their shader node graphs.

use serde::{Deserialize, Serialize};

/// Name of the graph root node.
pub const OUTPUT_NODE: &str = "Material Output";

/// Node kind of the graph root.
pub const OUTPUT_KIND: &str = "OUTPUT_MATERIAL";

/// Node kind of an image texture.
pub const IMAGE_TEXTURE_KIND: &str = "TEX_IMAGE";

/// A shader node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderNode {
    pub name: String,
    /// Node type identifier, e.g. `BSDF_PRINCIPLED` or `TEX_IMAGE`.
    pub kind: String,
    /// Image referenced by an image texture node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ShaderNode {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            image: None,
        }
    }

    pub fn image_texture(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: IMAGE_TEXTURE_KIND.to_string(),
            image: Some(image.into()),
        }
    }
}

/// A directed link from one node's output into a named input socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLink {
    pub from_node: String,
    pub to_node: String,
    pub to_socket: String,
}

impl NodeLink {
    pub fn new(from: impl Into<String>, to: impl Into<String>, socket: impl Into<String>) -> Self {
        Self {
            from_node: from.into(),
            to_node: to.into(),
            to_socket: socket.into(),
        }
    }
}

/// A material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,
    #[serde(default = "default_use_nodes")]
    pub use_nodes: bool,
    #[serde(default = "default_base_color")]
    pub base_color: [f32; 4],
    #[serde(default)]
    pub nodes: Vec<ShaderNode>,
    #[serde(default)]
    pub links: Vec<NodeLink>,
}

fn default_use_nodes() -> bool {
    true
}

fn default_base_color() -> [f32; 4] {
    [0.8, 0.8, 0.8, 1.0]
}

impl Material {
    /// A node-less material with only a base colour.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            use_nodes: true,
            base_color: default_base_color(),
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }

    /// The usual `Principled BSDF -> Material Output` graph, optionally
    /// with an image texture feeding the base colour.
    pub fn principled(name: impl Into<String>, image: Option<&str>) -> Self {
        let mut material = Self::new(name);
        material.nodes.push(ShaderNode::new(OUTPUT_NODE, OUTPUT_KIND));
        material.nodes.push(ShaderNode::new("Principled BSDF", "BSDF_PRINCIPLED"));
        material
            .links
            .push(NodeLink::new("Principled BSDF", OUTPUT_NODE, "Surface"));
        if let Some(image) = image {
            material.nodes.push(ShaderNode::image_texture("Image Texture", image));
            material
                .links
                .push(NodeLink::new("Image Texture", "Principled BSDF", "Base Color"));
        }
        material
    }

    pub fn node(&self, name: &str) -> Option<&ShaderNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Links feeding `node`'s input `socket`.
    pub fn inputs_to<'a>(&'a self, node: &'a str, socket: &'a str) -> impl Iterator<Item = &'a NodeLink> + 'a {
        self.links
            .iter()
            .filter(move |l| l.to_node == node && l.to_socket == socket)
    }

    /// Every link touching `node`, in either direction.
    pub fn links_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a NodeLink> + 'a {
        self.links
            .iter()
            .filter(move |l| l.to_node == node || l.from_node == node)
    }

    /// Images referenced by image texture nodes, in node order.
    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.kind == IMAGE_TEXTURE_KIND)
            .filter_map(|n| n.image.as_deref())
    }

    /// Reroute every image texture node pointing at `from` to `to`.
    ///
    /// Returns the number of nodes changed.
    pub fn replace_image(&mut self, from: &str, to: &str) -> usize {
        let mut changed = 0;
        for node in &mut self.nodes {
            if node.kind == IMAGE_TEXTURE_KIND && node.image.as_deref() == Some(from) {
                node.image = Some(to.to_string());
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principled_graph() {
        let mat = Material::principled("Wood", Some("wood.png"));
        assert_eq!(mat.inputs_to(OUTPUT_NODE, "Surface").count(), 1);
        assert_eq!(mat.images().collect::<Vec<_>>(), vec!["wood.png"]);
        assert_eq!(mat.links_of("Principled BSDF").count(), 2);
    }

    #[test]
    fn test_replace_image() {
        let mut mat = Material::principled("Wood", Some("wood.png"));
        assert_eq!(mat.replace_image("wood.png", "wood.png_Scaled"), 1);
        assert_eq!(mat.images().next(), Some("wood.png_Scaled"));
        assert_eq!(mat.replace_image("missing", "x"), 0);
    }
}
