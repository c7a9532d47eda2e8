//! Material definitions for the G-buffer pass

use crate::backend::TextureHandle;
use crate::pipeline::gbuffer_pass::GBufferParams;
use crate::shader::Shader;
use glam::{Mat4, Vec4};

/// Surface description written into the G-buffer
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    /// Shader variant; `None` uses the renderer's shared G-buffer shader
    pub shader: Option<Shader<GBufferParams>>,
    /// Tint, multiplied with the albedo map when present
    pub albedo: Vec4,
    pub roughness: f32,
    pub metallic: f32,
    pub ao: f32,

    pub albedo_map: Option<TextureHandle>,
    pub normal_map: Option<TextureHandle>,
    pub metallic_map: Option<TextureHandle>,
    pub roughness_map: Option<TextureHandle>,
    pub ao_map: Option<TextureHandle>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shader: None,
            albedo: Vec4::ONE,
            roughness: 0.5,
            metallic: 0.0,
            ao: 1.0,
            albedo_map: None,
            normal_map: None,
            metallic_map: None,
            roughness_map: None,
            ao_map: None,
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Material used for entities without a material component: a white
    /// albedo map with a white tint, fully rough and dielectric
    pub fn fallback(white: TextureHandle) -> Self {
        Self {
            name: "fallback".to_string(),
            roughness: 1.0,
            albedo_map: Some(white),
            ..Default::default()
        }
    }

    pub fn with_albedo(mut self, color: Vec4) -> Self {
        self.albedo = color;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_ao(mut self, ao: f32) -> Self {
        self.ao = ao;
        self
    }

    pub fn with_shader(mut self, shader: Shader<GBufferParams>) -> Self {
        self.shader = Some(shader);
        self
    }

    pub fn with_albedo_map(mut self, texture: TextureHandle) -> Self {
        self.albedo_map = Some(texture);
        self
    }

    pub fn with_normal_map(mut self, texture: TextureHandle) -> Self {
        self.normal_map = Some(texture);
        self
    }

    pub fn with_metallic_map(mut self, texture: TextureHandle) -> Self {
        self.metallic_map = Some(texture);
        self
    }

    pub fn with_roughness_map(mut self, texture: TextureHandle) -> Self {
        self.roughness_map = Some(texture);
        self
    }

    pub fn with_ao_map(mut self, texture: TextureHandle) -> Self {
        self.ao_map = Some(texture);
        self
    }

    /// Maps in texture-unit order (albedo, normal, metallic, roughness, AO)
    pub fn maps(&self) -> [Option<TextureHandle>; 5] {
        [
            self.albedo_map,
            self.normal_map,
            self.metallic_map,
            self.roughness_map,
            self.ao_map,
        ]
    }

    /// Per-draw parameter block for an entity using this material
    pub fn gbuffer_params(&self, model: Mat4, entity_id: i32) -> GBufferParams {
        GBufferParams {
            model,
            albedo: self.albedo,
            roughness: self.roughness,
            metallic: self.metallic,
            ao: self.ao,
            entity_id,
            has_albedo_map: self.albedo_map.is_some() as i32,
            has_normal_map: self.normal_map.is_some() as i32,
            has_metallic_map: self.metallic_map.is_some() as i32,
            has_roughness_map: self.roughness_map.is_some() as i32,
            has_ao_map: self.ao_map.is_some() as i32,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        }
    }

    // Preset materials

    pub fn plastic(color: Vec4) -> Self {
        Self::new("plastic")
            .with_albedo(color)
            .with_roughness(0.4)
    }

    pub fn metal(color: Vec4, roughness: f32) -> Self {
        Self::new("metal")
            .with_albedo(color)
            .with_metallic(1.0)
            .with_roughness(roughness)
    }

    pub fn gold() -> Self {
        Self::metal(Vec4::new(1.0, 0.766, 0.336, 1.0), 0.3)
    }
}
