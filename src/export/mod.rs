//! Asset serialization.
//!
//! [`AssetWriter`] turns the current state of a scene (working copies bound
//! in place) into a binary payload. The default writer produces GLB.

pub mod glb;

pub use glb::{read_glb_json, GlbWriter, WEBP_MAX_DIMENSION};

use crate::error::Result;
use crate::scene::Scene;
use crate::types::ObjectRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How images are embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageMode {
    /// Lossless WebP through `EXT_texture_webp`.
    #[default]
    Webp,
    /// PNG for images with alpha, JPEG otherwise.
    Auto,
    /// The packed source bytes as they are; PNG when there is none.
    None,
}

impl ImageMode {
    /// This mode followed by the modes to fall back to, in order.
    pub fn fallback_chain(self) -> Vec<ImageMode> {
        const ORDER: [ImageMode; 3] = [ImageMode::Webp, ImageMode::Auto, ImageMode::None];
        ORDER.iter().copied().skip_while(|m| *m != self).collect()
    }
}

impl fmt::Display for ImageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageMode::Webp => write!(f, "WEBP"),
            ImageMode::Auto => write!(f, "AUTO"),
            ImageMode::None => write!(f, "NONE"),
        }
    }
}

/// Resolved mesh quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantization {
    /// 0-10; 1 and up reorder vertices, 5 and up also sort triangles.
    pub level: u32,
    pub position_bits: u8,
    pub normal_bits: u8,
    pub texcoord_bits: u8,
}

/// Settings for one serialization attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SerializeSettings {
    pub image_mode: ImageMode,
    /// `None` writes plain float attributes.
    pub quantization: Option<Quantization>,
}

impl Default for SerializeSettings {
    fn default() -> Self {
        Self {
            image_mode: ImageMode::Webp,
            quantization: None,
        }
    }
}

/// Entities written as top-level nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSet {
    pub objects: Vec<ObjectRef>,
}

impl ExportSet {
    pub fn new(objects: Vec<ObjectRef>) -> Self {
        Self { objects }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

/// Serializes entities of a scene into a binary payload.
pub trait AssetWriter: Send + Sync {
    fn write(&self, scene: &Scene, set: &ExportSet, settings: &SerializeSettings) -> Result<Vec<u8>>;
}
