//! Image data blocks.

use image::{imageops::FilterType, RgbaImage};

/// Decoded image plus, optionally, the encoded file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub name: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// RGBA8 pixel data (4 bytes per pixel).
    pub pixels: Vec<u8>,
    /// Original encoded bytes and their MIME type, when the image was loaded from a file.
    pub packed: Option<PackedSource>,
}

/// An encoded image file kept alongside the decoded pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedSource {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    /// Create a new image from RGBA data.
    pub fn new(name: impl Into<String>, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            pixels,
            packed: None,
        }
    }

    /// A solid-colour image.
    pub fn solid(name: impl Into<String>, width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::new(name, width, height, pixels)
    }

    /// Check if this image has transparency.
    pub fn has_transparency(&self) -> bool {
        self.pixels.chunks(4).any(|pixel| pixel[3] < 255)
    }

    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// A copy scaled so its longest side is `max_dimension`, aspect preserved.
    ///
    /// The copy carries no packed source; it only exists decoded.
    pub fn scaled_copy(&self, name: impl Into<String>, max_dimension: u32) -> Option<Self> {
        let source = self.to_rgba_image()?;
        let (width, height) = scaled_dimensions(self.width, self.height, max_dimension);
        let resized = image::imageops::resize(&source, width, height, FilterType::Lanczos3);
        Some(Self::new(name, width, height, resized.into_raw()))
    }
}

/// Dimensions with the longest side clamped to `max_dimension`, each side at least 1.
pub fn scaled_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width, height);
    }
    let scale = max_dimension as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Load an image from encoded bytes, keeping the bytes as the packed source.
pub fn load_image_from_bytes(name: &str, data: &[u8]) -> Result<ImageData, image::ImageError> {
    let format = image::guess_format(data)?;
    let img = image::load_from_memory_with_format(data, format)?;
    let rgba = img.to_rgba8();

    Ok(ImageData {
        name: name.to_string(),
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
        packed: Some(PackedSource {
            bytes: data.to_vec(),
            mime_type: format.to_mime_type().to_string(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_dimensions_preserve_aspect() {
        assert_eq!(scaled_dimensions(2048, 1024, 1024), (1024, 512));
        assert_eq!(scaled_dimensions(512, 512, 1024), (512, 512));
        assert_eq!(scaled_dimensions(4096, 2, 256), (256, 1));
    }

    #[test]
    fn test_scaled_copy() {
        let img = ImageData::solid("grass", 64, 32, [10, 200, 10, 255]);
        let scaled = img.scaled_copy("grass_Scaled", 16).unwrap();
        assert_eq!((scaled.width, scaled.height), (16, 8));
        assert_eq!(scaled.pixels.len(), 16 * 8 * 4);
        assert!(scaled.packed.is_none());
        assert!(!scaled.has_transparency());
    }

    #[test]
    fn test_load_image_from_bytes_keeps_source() {
        let img = RgbaImage::from_pixel(4, 4, image::Rgba([1, 2, 3, 128]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let data = load_image_from_bytes("tex", &bytes).unwrap();
        assert_eq!((data.width, data.height), (4, 4));
        assert!(data.has_transparency());
        let packed = data.packed.unwrap();
        assert_eq!(packed.mime_type, "image/png");
        assert_eq!(packed.bytes, bytes);
    }
}
