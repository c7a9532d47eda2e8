//! Directional shadow map pass
//!
//! Renders scene depth from the dominant directional light into a square
//! depth-only framebuffer using an orthographic projection.

use super::shader_path;
use crate::backend::*;
use crate::renderer::RendererError;
use crate::scene::Scene;
use crate::shader::{ParamField, ParamType, Shader, ShaderParameters};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::offset_of;
use std::path::Path;

/// Binding point of the light-space matrix
pub const SHADOW_BINDING: u32 = 2;

/// Default shadow map edge in texels
pub const DEFAULT_SHADOW_MAP_SIZE: u32 = 4096;

/// Light-space transform read by the shadow and lighting shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadowUniformData {
    pub light_space: Mat4,
}

/// Per-draw parameters of the depth-only shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ShadowParams {
    pub model: Mat4,
}

impl ShaderParameters for ShadowParams {
    const FIELDS: &'static [ParamField] = &[ParamField::new(
        "model",
        ParamType::Mat4,
        offset_of!(ShadowParams, model),
    )];
}

pub const SHADOW_SHADER: &str = r#"
struct ShadowUniforms {
    light_space: mat4x4<f32>,
}

struct ShadowParams {
    model: mat4x4<f32>,
}

@group(0) @binding(2) var<uniform> shadow: ShadowUniforms;
@group(1) @binding(0) var<uniform> params: ShadowParams;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return shadow.light_space * params.model * vec4<f32>(position, 1.0);
}
"#;

pub fn shadow_shader_descriptor(shader_dir: Option<&Path>) -> ShaderDescriptor {
    ShaderDescriptor::new("shadow", SHADOW_SHADER)
        .with_path(shader_path(shader_dir, "shadow"))
        .with_uniform_buffer(SHADOW_BINDING, std::mem::size_of::<ShadowUniformData>() as u64)
        .depth_only()
}

/// Orthographic light frustum with cached matrices
#[derive(Debug, Clone)]
pub struct ShadowFrustum {
    ortho_size: f32,
    near: f32,
    far: f32,
    direction: Vec3,
    projection: Mat4,
    view: Mat4,
}

impl Default for ShadowFrustum {
    fn default() -> Self {
        Self::new(20.0, 1.0, 200.0, Vec3::NEG_Y)
    }
}

impl ShadowFrustum {
    pub fn new(ortho_size: f32, near: f32, far: f32, direction: Vec3) -> Self {
        let mut frustum = Self {
            ortho_size,
            near,
            far,
            direction: direction.normalize_or_zero(),
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        };
        if frustum.direction == Vec3::ZERO {
            frustum.direction = Vec3::NEG_Y;
        }
        frustum.update_projection();
        frustum.update_view();
        frustum
    }

    /// Change the ortho half-size and clip range. Returns whether the
    /// projection had to be rebuilt.
    pub fn set_bounds(&mut self, ortho_size: f32, near: f32, far: f32) -> bool {
        if (ortho_size, near, far) == (self.ortho_size, self.near, self.far) {
            return false;
        }
        self.ortho_size = ortho_size;
        self.near = near;
        self.far = far;
        self.update_projection();
        // the eye distance depends on far
        self.update_view();
        true
    }

    /// Point the light along `direction`. Returns whether the view had to be
    /// rebuilt; zero directions are ignored.
    pub fn set_direction(&mut self, direction: Vec3) -> bool {
        let direction = direction.normalize_or_zero();
        if direction == Vec3::ZERO || direction == self.direction {
            return false;
        }
        self.direction = direction;
        self.update_view();
        true
    }

    fn update_projection(&mut self) {
        let s = self.ortho_size;
        self.projection = Mat4::orthographic_rh(-s, s, -s, s, self.near, self.far);
    }

    fn update_view(&mut self) {
        let up = if self.direction.dot(Vec3::Y).abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let eye = -self.direction * self.far / 4.0;
        self.view = Mat4::look_at_rh(eye, Vec3::ZERO, up);
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn near(&self) -> f32 {
        self.near
    }

    pub fn far(&self) -> f32 {
        self.far
    }

    pub fn ortho_size(&self) -> f32 {
        self.ortho_size
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn light_space(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn uniform_data(&self) -> ShadowUniformData {
        ShadowUniformData {
            light_space: self.light_space(),
        }
    }
}

/// Depth-only render of every mesh from the light
pub struct ShadowPass {
    framebuffer: FramebufferHandle,
    shader: Shader<ShadowParams>,
    size: u32,
}

impl ShadowPass {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        size: u32,
        shader_dir: Option<&Path>,
    ) -> Result<Self, RendererError> {
        let spec = FramebufferSpec::new("shadow", size, size)
            .with_attachment(TextureFormat::Depth32Float);
        let framebuffer = backend
            .create_framebuffer(&spec)
            .map_err(|source| RendererError::Initialization {
                resource: "shadow framebuffer",
                source,
            })?;
        let shader = Shader::load(backend, shadow_shader_descriptor(shader_dir))?;

        Ok(Self {
            framebuffer,
            shader,
            size,
        })
    }

    /// Render depth for every loaded mesh; returns the number of draws
    pub fn execute<B: GraphicsBackend>(&self, backend: &mut B, scene: Option<&mut Scene>) -> usize {
        backend.bind_framebuffer(self.framebuffer);
        backend.set_depth_test(true);
        backend.set_depth_compare(CompareFunction::Less);
        backend.clear([0.0, 0.0, 0.0, 0.0], 1.0);
        self.shader.bind(backend);

        let mut draws = 0;
        if let Some(scene) = scene {
            scene.for_each_mesh(|_, transform, mesh, _| {
                let Some(handle) = mesh.renderable() else {
                    return;
                };
                self.shader.set_params(
                    backend,
                    &ShadowParams {
                        model: transform.transform(),
                    },
                );
                backend.draw_mesh(handle);
                draws += 1;
            });
        }

        backend.unbind_framebuffer();
        draws
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    /// The depth texture the lighting pass samples
    pub fn depth_texture<B: GraphicsBackend>(&self, backend: &B) -> Option<TextureHandle> {
        backend.depth_attachment(self.framebuffer)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn shader(&self) -> &Shader<ShadowParams> {
        &self.shader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MeshComponent, Transform};
    use glam::Vec4;

    #[test]
    fn test_light_space_maps_origin_inside() {
        let frustum = ShadowFrustum::default();
        let p = frustum.light_space() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(p.x.abs() < 1e-4 && p.y.abs() < 1e-4);
        assert!(p.z > 0.0 && p.z < 1.0);
    }

    #[test]
    fn test_vertical_direction_uses_z_up() {
        let frustum = ShadowFrustum::new(20.0, 1.0, 200.0, Vec3::NEG_Y);
        assert!(frustum.view().is_finite());
        let eye = frustum.view().inverse().transform_point3(Vec3::ZERO);
        assert!((eye - Vec3::new(0.0, 50.0, 0.0)).length() < 1e-3);
    }

    #[test]
    fn test_caching() {
        let mut frustum = ShadowFrustum::default();
        assert!(!frustum.set_bounds(20.0, 1.0, 200.0));
        assert!(frustum.set_bounds(10.0, 1.0, 200.0));
        assert!(!frustum.set_direction(Vec3::new(0.0, -3.0, 0.0)));
        assert!(frustum.set_direction(Vec3::new(1.0, -1.0, 0.0)));
        assert!(!frustum.set_direction(Vec3::ZERO));
    }

    #[test]
    fn test_empty_path_is_not_drawn() {
        let mut backend = HeadlessBackend::new();
        let pass = ShadowPass::new(&mut backend, 256, None).unwrap();
        let cube = crate::resources::Mesh::cube().upload(&mut backend).unwrap();

        let mut scene = Scene::new("shadow");
        let drawn = scene.create_entity("drawn");
        scene.insert(drawn, MeshComponent::new("cube", cube));
        let hidden = scene.create_entity("hidden");
        scene.insert(
            hidden,
            MeshComponent {
                path: String::new(),
                mesh: Some(cube),
            },
        );
        scene.insert(hidden, Transform::from_translation(Vec3::X));

        assert_eq!(pass.execute(&mut backend, Some(&mut scene)), 1);
        assert_eq!(backend.draws_into(pass.framebuffer()).len(), 1);
        assert_eq!(pass.execute(&mut backend, None), 0);
    }
}
