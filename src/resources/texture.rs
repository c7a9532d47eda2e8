//! Texture loading and default textures

use crate::backend::*;
use image::{DynamicImage, GenericImageView};
use std::path::Path;

/// Decoded texels ready for upload
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Load an 8-bit texture from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, image::ImageError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let img = image::open(path)?;
        Ok(Self::from_image(img, &name))
    }

    /// Load an 8-bit texture from encoded bytes
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(img, name))
    }

    fn from_image(img: DynamicImage, name: &str) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// 1x1 texture of one color
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            data: color.to_vec(),
            name: name.to_string(),
        }
    }

    /// Upload as a sampled texture
    pub fn upload<B: GraphicsBackend>(&self, backend: &mut B) -> BackendResult<TextureHandle> {
        backend.create_texture(
            &TextureDescriptor {
                label: Some(self.name.clone()),
                width: self.width,
                height: self.height,
                format: self.format,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            },
            Some(&self.data),
        )
    }
}

/// Textures bound when a material map or environment input is absent
#[derive(Debug, Clone, Copy)]
pub struct DefaultTextures {
    pub white: TextureHandle,
    pub black: TextureHandle,
    /// Tangent-space +Z
    pub flat_normal: TextureHandle,
}

impl DefaultTextures {
    pub fn create<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Self> {
        Ok(Self {
            white: TextureData::solid_color([255, 255, 255, 255], "default_white").upload(backend)?,
            black: TextureData::solid_color([0, 0, 0, 255], "default_black").upload(backend)?,
            flat_normal: TextureData::solid_color([128, 128, 255, 255], "default_normal")
                .upload(backend)?,
        })
    }

    pub fn release<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_texture(self.white);
        backend.destroy_texture(self.black);
        backend.destroy_texture(self.flat_normal);
    }
}
