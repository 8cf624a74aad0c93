//! Export options.

use crate::error::{BridgeError, Result};
use crate::export::{ImageMode, Quantization};
use crate::reduce::ReductionMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Texture size choices for downscaling.
pub const TEXTURE_SIZES: [u32; 4] = [256, 512, 1024, 2048];

/// Mesh compression preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompressionPreset {
    None,
    Low,
    #[default]
    Medium,
    High,
    /// Use the level and bit depths given in [`CompressionOptions`].
    Custom,
}

impl std::fmt::Display for CompressionPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompressionPreset::None => "NONE",
            CompressionPreset::Low => "LOW",
            CompressionPreset::Medium => "MEDIUM",
            CompressionPreset::High => "HIGH",
            CompressionPreset::Custom => "CUSTOM",
        };
        f.write_str(name)
    }
}

/// Mesh compression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    pub preset: CompressionPreset,
    /// Compression level (0-10); higher reorders geometry more aggressively.
    pub level: u32,
    /// Quantization bits for positions (8-16).
    pub position_bits: u8,
    /// Quantization bits for normals (8-16).
    pub normal_bits: u8,
    /// Quantization bits for texture coordinates (8-16).
    pub texcoord_bits: u8,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            preset: CompressionPreset::Medium,
            level: 6,
            position_bits: 14,
            normal_bits: 10,
            texcoord_bits: 12,
        }
    }
}

impl CompressionOptions {
    /// Resolve the preset into concrete quantization settings; `None` means uncompressed.
    pub fn quantization(&self) -> Option<Quantization> {
        let (level, position_bits, normal_bits, texcoord_bits) = match self.preset {
            CompressionPreset::None => return None,
            CompressionPreset::Low => (3, 16, 12, 14),
            CompressionPreset::Medium => (6, 14, 10, 12),
            CompressionPreset::High => (10, 11, 8, 10),
            CompressionPreset::Custom => (self.level, self.position_bits, self.normal_bits, self.texcoord_bits),
        };
        Some(Quantization {
            level,
            position_bits,
            normal_bits,
            texcoord_bits,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.preset != CompressionPreset::None
    }
}

/// Subdivision clamp settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubdivisionOptions {
    pub enabled: bool,
    /// Highest subdivision level allowed at export (0-6).
    pub level: u32,
    /// Objects left alone.
    pub excluded: Vec<String>,
    /// Per-object caps replacing `level`.
    pub overrides: BTreeMap<String, u32>,
}

impl Default for SubdivisionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 2,
            excluded: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }
}

/// Mesh reduction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionOptions {
    pub enabled: bool,
    /// Fraction of faces to keep (0.01-1.0).
    pub ratio: f32,
    pub excluded: Vec<String>,
    /// Per-object ratios replacing `ratio`.
    pub overrides: BTreeMap<String, f32>,
    pub method: ReductionMethod,
    /// Meshes with this many faces or fewer are not reduced.
    pub min_faces: usize,
}

impl Default for ReductionOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            ratio: 0.1,
            excluded: Vec::new(),
            overrides: BTreeMap::new(),
            method: ReductionMethod::Auto,
            min_faces: 10,
        }
    }
}

/// UV generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UvOptions {
    pub enabled: bool,
    /// Join same-material objects into one atlas mesh.
    pub atlasing: bool,
    /// Smallest group that gets an atlas (2-10).
    pub min_group_size: usize,
    /// Gap between atlas cells, in UV units.
    pub atlas_margin: f32,
    /// Gap between islands of an individual unwrap, in UV units.
    pub island_margin: f32,
}

impl Default for UvOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            atlasing: true,
            min_group_size: 2,
            atlas_margin: 0.05,
            island_margin: 0.02,
        }
    }
}

/// Texture downscale settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureOptions {
    pub enabled: bool,
    /// Longest side allowed; one of 256, 512, 1024, 2048.
    pub max_size: u32,
    /// Materials whose images are never scaled.
    pub excluded_materials: Vec<String>,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1024,
            excluded_materials: Vec::new(),
        }
    }
}

/// Everything one export run can be told.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub compression: CompressionOptions,
    pub subdivision: SubdivisionOptions,
    pub reduction: ReductionOptions,
    pub uv: UvOptions,
    pub textures: TextureOptions,
    /// Drop material slots no face uses.
    pub prune_materials: bool,
    /// First image mode of the fallback chain.
    pub image_mode: ImageMode,
    /// Payload filename; derived from the scene file when absent.
    pub filename: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            compression: CompressionOptions::default(),
            subdivision: SubdivisionOptions::default(),
            reduction: ReductionOptions::default(),
            uv: UvOptions::default(),
            textures: TextureOptions::default(),
            prune_materials: true,
            image_mode: ImageMode::Webp,
            filename: None,
        }
    }
}

impl ExportOptions {
    /// Load options from a JSON file and validate them.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut options: ExportOptions = serde_json::from_str(&contents)?;
        options.validate()?;
        Ok(options)
    }

    /// Clamp values into their documented ranges; reject values that can not be clamped.
    pub fn validate(&mut self) -> Result<()> {
        let r = &mut self.reduction;
        if !r.ratio.is_finite() {
            return Err(BridgeError::InvalidOptions(format!("reduction ratio {} is not a number", r.ratio)));
        }
        r.ratio = r.ratio.clamp(0.01, 1.0);
        for (name, ratio) in r.overrides.iter_mut() {
            if !ratio.is_finite() {
                return Err(BridgeError::InvalidOptions(format!(
                    "reduction override for '{}' is not a number",
                    name
                )));
            }
            *ratio = ratio.clamp(0.01, 1.0);
        }

        self.subdivision.level = self.subdivision.level.min(6);
        for level in self.subdivision.overrides.values_mut() {
            *level = (*level).min(6);
        }

        self.uv.min_group_size = self.uv.min_group_size.clamp(2, 10);
        if !self.uv.atlas_margin.is_finite() || !self.uv.island_margin.is_finite() {
            return Err(BridgeError::InvalidOptions("UV margins must be numbers".to_string()));
        }
        self.uv.atlas_margin = self.uv.atlas_margin.clamp(0.0, 0.5);
        self.uv.island_margin = self.uv.island_margin.clamp(0.0, 0.5);

        if !TEXTURE_SIZES.contains(&self.textures.max_size) {
            return Err(BridgeError::InvalidOptions(format!(
                "texture size {} is not one of {:?}",
                self.textures.max_size, TEXTURE_SIZES
            )));
        }

        let c = &mut self.compression;
        c.level = c.level.min(10);
        if c.preset == CompressionPreset::Custom {
            for (label, bits) in [
                ("position", c.position_bits),
                ("normal", c.normal_bits),
                ("texcoord", c.texcoord_bits),
            ] {
                if !(8..=16).contains(&bits) {
                    return Err(BridgeError::InvalidOptions(format!(
                        "{} quantization of {} bits is outside 8-16",
                        label, bits
                    )));
                }
            }
        }

        Ok(())
    }

    /// Reduction ratio for one object.
    pub fn reduction_ratio(&self, object: &str) -> f32 {
        self.reduction
            .overrides
            .get(object)
            .copied()
            .unwrap_or(self.reduction.ratio)
    }

    /// Subdivision cap for one object.
    pub fn subdivision_level(&self, object: &str) -> u32 {
        self.subdivision
            .overrides
            .get(object)
            .copied()
            .unwrap_or(self.subdivision.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ExportOptions::default();
        assert_eq!(options.subdivision.level, 2);
        assert!(!options.reduction.enabled);
        assert_eq!(options.reduction.ratio, 0.1);
        assert_eq!(options.uv.min_group_size, 2);
        assert_eq!(options.textures.max_size, 1024);
        assert_eq!(options.image_mode, ImageMode::Webp);
        assert_eq!(options.compression.preset, CompressionPreset::Medium);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options: ExportOptions =
            serde_json::from_str(r#"{"reduction": {"enabled": true, "ratio": 0.25}, "compression": {"preset": "HIGH"}}"#)
                .unwrap();
        assert!(options.reduction.enabled);
        assert_eq!(options.reduction.ratio, 0.25);
        assert_eq!(options.reduction.min_faces, 10);
        assert!(options.prune_materials);
        let q = options.compression.quantization().unwrap();
        assert_eq!((q.level, q.position_bits, q.normal_bits, q.texcoord_bits), (10, 11, 8, 10));
    }

    #[test]
    fn test_validate_clamps() {
        let mut options = ExportOptions::default();
        options.reduction.ratio = 5.0;
        options.subdivision.level = 9;
        options.uv.min_group_size = 0;
        options.validate().unwrap();
        assert_eq!(options.reduction.ratio, 1.0);
        assert_eq!(options.subdivision.level, 6);
        assert_eq!(options.uv.min_group_size, 2);
    }

    #[test]
    fn test_validate_rejects() {
        let mut options = ExportOptions::default();
        options.textures.max_size = 300;
        assert!(matches!(options.validate(), Err(BridgeError::InvalidOptions(_))));

        let mut options = ExportOptions::default();
        options.compression.preset = CompressionPreset::Custom;
        options.compression.position_bits = 20;
        assert!(options.validate().is_err());

        let mut options = ExportOptions::default();
        options.reduction.ratio = f32::NAN;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_per_object_overrides() {
        let mut options = ExportOptions::default();
        options.reduction.overrides.insert("Rock".to_string(), 0.5);
        options.subdivision.overrides.insert("Rock".to_string(), 1);
        assert_eq!(options.reduction_ratio("Rock"), 0.5);
        assert_eq!(options.reduction_ratio("Tree"), 0.1);
        assert_eq!(options.subdivision_level("Rock"), 1);
        assert_eq!(options.subdivision_level("Tree"), 2);
    }

    #[test]
    fn test_no_compression() {
        let mut options = ExportOptions::default();
        options.compression.preset = CompressionPreset::None;
        assert!(options.compression.quantization().is_none());
        assert!(!options.compression.is_enabled());
    }
}
