//! Texture downscaling through scaled copies.
//!
//! Originals are never resized. Oversized images get a `<name>_Scaled`
//! copy and the working set's materials are pointed at it for the run.

use crate::scene::Scene;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Suffix of scaled image copies.
pub const SCALED_SUFFIX: &str = "_Scaled";

/// One rerouted image.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureSubstitution {
    pub original: String,
    pub replacement: String,
    /// Materials whose nodes now point at the replacement.
    pub materials: Vec<String>,
}

/// Outcome of one scaling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextureResult {
    pub processed: usize,
    pub substitutions: Vec<TextureSubstitution>,
    pub errors: Vec<String>,
}

/// Downscales the images of a set of materials.
pub trait TextureScaler {
    fn process(&self, scene: &mut Scene, materials: &BTreeSet<String>, target: u32, excluded: &[String])
        -> TextureResult;
}

/// Lanczos3 downscale via `image::imageops`.
#[derive(Debug, Default)]
pub struct LanczosScaler;

impl TextureScaler for LanczosScaler {
    fn process(
        &self,
        scene: &mut Scene,
        materials: &BTreeSet<String>,
        target: u32,
        excluded: &[String],
    ) -> TextureResult {
        let mut result = TextureResult::default();

        let materials: Vec<&String> = materials
            .iter()
            .filter(|m| !excluded.contains(*m))
            .collect();
        let images: BTreeSet<String> = materials
            .iter()
            .filter_map(|m| scene.material(m))
            .filter(|m| m.use_nodes)
            .flat_map(|m| m.images().map(str::to_string))
            .collect();

        for name in images {
            let Some(image) = scene.image(&name) else {
                result.errors.push(format!("Image {} is missing", name));
                continue;
            };
            if image.width == 0 || image.height == 0 {
                result.errors.push(format!("Image {} has invalid dimensions", name));
                continue;
            }
            if image.max_dimension() <= target {
                continue;
            }

            let copy_name = scene.unique_image_name(&format!("{}{}", name, SCALED_SUFFIX));
            let Some(copy) = image.scaled_copy(copy_name, target) else {
                warn!(image = %name, "Pixel buffer does not match dimensions");
                result.errors.push(format!("Error scaling {}: pixel buffer does not match dimensions", name));
                continue;
            };
            debug!(
                image = %name,
                from = ?(image.width, image.height),
                to = ?(copy.width, copy.height),
                "Scaled texture"
            );
            let replacement = scene.add_image(copy);

            let mut rerouted = Vec::new();
            for material in &materials {
                if let Some(m) = scene.materials.get_mut(material.as_str()) {
                    if m.replace_image(&name, &replacement) > 0 {
                        rerouted.push(material.to_string());
                    }
                }
            }

            result.processed += 1;
            result.substitutions.push(TextureSubstitution {
                original: name,
                replacement,
                materials: rerouted,
            });
        }

        result
    }
}

/// Point materials back at the original images. Returns the number of nodes rerouted.
pub fn restore(scene: &mut Scene, substitutions: &[TextureSubstitution]) -> usize {
    let mut rerouted = 0;
    for sub in substitutions {
        for material in &sub.materials {
            match scene.materials.get_mut(material) {
                Some(m) => rerouted += m.replace_image(&sub.replacement, &sub.original),
                None => warn!(material = %material, "Material vanished before texture restore"),
            }
        }
    }
    rerouted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{ImageData, Material};

    fn scene() -> Scene {
        let mut scene = Scene::new("Test");
        scene.add_image(ImageData::solid("big.png", 256, 128, [200, 0, 0, 255]));
        scene.add_image(ImageData::solid("small.png", 32, 32, [0, 0, 200, 255]));
        scene.add_material(Material::principled("Big", Some("big.png")));
        scene.add_material(Material::principled("Small", Some("small.png")));
        scene.add_material(Material::principled("Excluded", Some("big.png")));
        scene
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_scales_only_oversized() {
        let mut scene = scene();
        let result = LanczosScaler.process(&mut scene, &set(&["Big", "Small"]), 64, &[]);

        assert_eq!(result.processed, 1);
        assert!(result.errors.is_empty());
        let sub = &result.substitutions[0];
        assert_eq!(sub.original, "big.png");
        assert_eq!(sub.replacement, "big.png_Scaled");
        let scaled = scene.image("big.png_Scaled").unwrap();
        assert_eq!((scaled.width, scaled.height), (64, 32));
        assert_eq!(scene.image("big.png").unwrap().width, 256);
        assert_eq!(scene.material("Big").unwrap().images().next(), Some("big.png_Scaled"));
        // Materials outside the working set keep the original.
        assert_eq!(scene.material("Excluded").unwrap().images().next(), Some("big.png"));
    }

    #[test]
    fn test_restore_reverses_substitution() {
        let mut scene = scene();
        let before = scene.clone();
        let result = LanczosScaler.process(&mut scene, &set(&["Big", "Small"]), 64, &[]);
        assert_eq!(restore(&mut scene, &result.substitutions), 1);
        scene.remove_image("big.png_Scaled").unwrap();
        assert_eq!(scene, before);
    }

    #[test]
    fn test_excluded_materials_and_missing_images() {
        let mut scene = scene();
        scene.add_material(Material::principled("Broken", Some("gone.png")));
        let result = LanczosScaler.process(
            &mut scene,
            &set(&["Big", "Broken"]),
            64,
            &["Big".to_string()],
        );
        assert_eq!(result.processed, 0);
        assert_eq!(result.errors, vec!["Image gone.png is missing".to_string()]);
    }
}
